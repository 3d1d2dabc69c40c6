use serde::{Deserialize, Serialize};

use crate::replication::controller::ExecutionDetail;
use crate::replication::model::Registry;
use crate::replication::policy::Policy;

const REDACTED_SECRET: &str = "*****";

/// Request to start a manual replication
#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub policy_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct ExecutionListResponse {
    pub total: i64,
    pub executions: Vec<ExecutionDetail>,
}

/// Executions started by a notification
#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub executions: Vec<i64>,
}

/// Policy as exposed over the API, with registry secrets masked
pub fn redact_policy(mut policy: Policy) -> Policy {
    for registry in [&mut policy.src_registry, &mut policy.dest_registry]
        .into_iter()
        .flatten()
    {
        redact_registry(registry);
    }
    policy
}

fn redact_registry(registry: &mut Registry) {
    if let Some(credential) = registry.credential.as_mut() {
        if !credential.access_secret.is_empty() {
            credential.access_secret = REDACTED_SECRET.to_string();
        }
    }
}
