use super::handlers;
use crate::server::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

/// Replication API routes, nested under `/api/v1`
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/replication/adapters", get(handlers::list_adapters))
        .route("/replication/policies", get(handlers::list_policies))
        .route("/replication/policies/{policy_id}", get(handlers::get_policy))
        .route(
            "/replication/executions",
            get(handlers::list_executions).post(handlers::start_execution),
        )
        .route(
            "/replication/executions/{execution_id}",
            get(handlers::get_execution),
        )
        .route(
            "/replication/executions/{execution_id}/stop",
            post(handlers::stop_execution),
        )
        .route(
            "/replication/executions/{execution_id}/tasks",
            get(handlers::list_tasks),
        )
        .route(
            "/replication/executions/{execution_id}/tasks/{task_id}",
            get(handlers::get_task),
        )
        .route(
            "/replication/executions/{execution_id}/tasks/{task_id}/log",
            get(handlers::get_task_log),
        )
}

/// Callbacks from the job service and the registries
pub fn notification_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/service/notifications/jobs/replication/task/{task_id}",
            post(handlers::task_status_hook),
        )
        .route(
            "/service/notifications/registry",
            post(handlers::registry_notification),
        )
        .route(
            "/service/notifications/charts",
            post(handlers::chart_notification),
        )
}
