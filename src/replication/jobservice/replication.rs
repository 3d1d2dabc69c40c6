use async_trait::async_trait;
use std::sync::Arc;

use super::{JobContext, JobData, JobRunner};
use crate::replication::adapter::AdapterRegistry;
use crate::replication::model::Resource;
use crate::replication::transfer::{transfer_for, TransferError};

/// Job parameters carrying both resources as JSON strings
pub fn replication_parameters(
    src: &Resource,
    dst: &Resource,
) -> Result<serde_json::Value, serde_json::Error> {
    Ok(serde_json::json!({
        "src_resource": serde_json::to_string(src)?,
        "dst_resource": serde_json::to_string(dst)?,
    }))
}

fn resource_param(parameters: &serde_json::Value, key: &str) -> Result<Resource, TransferError> {
    let raw = parameters
        .get(key)
        .ok_or_else(|| TransferError::InvalidInput(format!("missing parameter {}", key)))?;
    let parsed = match raw {
        serde_json::Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| TransferError::InvalidInput(format!("invalid {}: {}", key, e)))
}

/// Runs one replication transfer inside a job worker
pub struct ReplicationJob {
    adapters: Arc<AdapterRegistry>,
}

impl ReplicationJob {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self { adapters }
    }
}

#[async_trait]
impl JobRunner for ReplicationJob {
    async fn run(&self, job: &JobData, ctx: &JobContext) -> Result<(), TransferError> {
        let src = resource_param(&job.parameters, "src_resource")?;
        let dst = resource_param(&job.parameters, "dst_resource")?;

        let src_registry = src
            .registry
            .as_ref()
            .ok_or_else(|| TransferError::InvalidInput("source registry missing".to_string()))?;
        let dst_registry = dst.registry.as_ref().ok_or_else(|| {
            TransferError::InvalidInput("destination registry missing".to_string())
        })?;
        let src_adapter = self.adapters.create(src_registry)?;
        let dst_adapter = self.adapters.create(dst_registry)?;

        let action = if dst.deleted { "deletion" } else { "copy" };
        ctx.log.info(format!(
            "Replicating ({}) {} from {} to {} on {}",
            action,
            src.display_name(),
            src_registry.url,
            dst.display_name(),
            dst_registry.url
        ));

        transfer_for(src.resource_type, src_adapter, dst_adapter, ctx.clone())
            .transfer(&src, &dst)
            .await
    }
}
