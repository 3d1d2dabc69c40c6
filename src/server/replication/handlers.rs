use super::models::{
    redact_policy, ExecutionListResponse, NotificationResponse, StartExecutionRequest,
    StartExecutionResponse,
};
use crate::replication::controller::ExecutionDetail;
use crate::replication::event::{ChartEvent, RegistryNotification, ReplicationEvent};
use crate::replication::execution::hook::HookOutcome;
use crate::replication::execution::{ExecutionQuery, Task, TaskQuery};
use crate::replication::jobservice::JobStatusChange;
use crate::replication::policy::{Policy, TriggerType};
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use subtle::ConstantTimeEq;

const SECRET_SCHEME: &str = "Harbor-Secret ";

/// Reject job callbacks that do not carry the shared secret
fn verify_hook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ServerError> {
    let Some(expected) = state.hook_secret.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(SECRET_SCHEME))
        .unwrap_or_default();
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ServerError::forbidden("Invalid job service secret"))
    }
}

pub async fn list_adapters(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.controller.adapter_types())
}

pub async fn list_policies(
    State(state): State<AppState>,
) -> Result<Json<Vec<Policy>>, ServerError> {
    let policies = state
        .controller
        .policies()
        .list()
        .await
        .internal_err("Failed to list policies")?;
    Ok(Json(policies.into_iter().map(redact_policy).collect()))
}

pub async fn get_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<i64>,
) -> Result<Json<Policy>, ServerError> {
    let policy = state.controller.get_policy(policy_id).await?;
    Ok(Json(redact_policy(policy)))
}

/// Start a manual replication of a policy
pub async fn start_execution(
    State(state): State<AppState>,
    Json(payload): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<StartExecutionResponse>), ServerError> {
    let id = state
        .controller
        .start_by_id(payload.policy_id, TriggerType::Manual)
        .await
        .map_err(|e| {
            ServerError::from(e).with_context("policy_id", payload.policy_id.to_string())
        })?;
    tracing::info!(policy_id = payload.policy_id, execution_id = id, "Manual replication started");
    Ok((StatusCode::CREATED, Json(StartExecutionResponse { id })))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<ExecutionListResponse>, ServerError> {
    let (executions, total) = state.controller.list_executions(&query).await?;
    Ok(Json(ExecutionListResponse { total, executions }))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<ExecutionDetail>, ServerError> {
    Ok(Json(state.controller.get_execution(execution_id).await?))
}

pub async fn stop_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<StatusCode, ServerError> {
    state
        .controller
        .stop_replication(execution_id)
        .await
        .map_err(|e| ServerError::from(e).with_context("execution_id", execution_id.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, ServerError> {
    Ok(Json(state.controller.list_tasks(execution_id, &query).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((execution_id, task_id)): Path<(i64, i64)>,
) -> Result<Json<Task>, ServerError> {
    Ok(Json(state.controller.get_task(execution_id, task_id).await?))
}

pub async fn get_task_log(
    State(state): State<AppState>,
    Path((execution_id, task_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ServerError> {
    let log = state.controller.get_task_log(execution_id, task_id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

/// Status callback posted by the job service
pub async fn task_status_hook(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(change): Json<JobStatusChange>,
) -> Result<StatusCode, ServerError> {
    verify_hook_secret(&state, &headers)?;
    match state.controller.handle_hook(task_id, change).await? {
        HookOutcome::Applied(status) => {
            tracing::debug!(task_id, status = %status, "Task status updated")
        }
        HookOutcome::Ignored => tracing::debug!(task_id, "Task status hook ignored"),
    }
    Ok(StatusCode::OK)
}

/// Registry notification envelope.
///
/// Registries send `application/vnd.docker.distribution.events.v1+json`, so
/// the body is parsed without checking the content type.
pub async fn registry_notification(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NotificationResponse>, ServerError> {
    let notification: RegistryNotification = serde_json::from_slice(&body)
        .map_err(|e| ServerError::bad_request(format!("Invalid notification: {}", e)))?;

    let mut executions = Vec::new();
    for event in ReplicationEvent::from_registry_notification(&notification) {
        executions.extend(
            state
                .events
                .handle(&event)
                .await
                .internal_err("Failed to handle registry event")?,
        );
    }
    Ok(Json(NotificationResponse { executions }))
}

pub async fn chart_notification(
    State(state): State<AppState>,
    Json(event): Json<ChartEvent>,
) -> Result<Json<NotificationResponse>, ServerError> {
    let executions = match ReplicationEvent::from_chart_event(&event) {
        Some(event) => state
            .events
            .handle(&event)
            .await
            .internal_err("Failed to handle chart event")?,
        None => {
            tracing::debug!(action = %event.action, "Ignoring chart event");
            Vec::new()
        }
    };
    Ok(Json(NotificationResponse { executions }))
}
