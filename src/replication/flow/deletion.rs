use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{
    assemble_dst_resources, filter_resources, finish_empty, initialize, schedule_resources, Flow,
    FlowContext,
};
use crate::replication::filter::FilterChain;
use crate::replication::model::Resource;
use crate::replication::policy::Policy;

/// Removes resources deleted at the source from the destination
pub struct DeletionFlow {
    execution_id: i64,
    policy: Policy,
    resources: Vec<Resource>,
}

impl DeletionFlow {
    pub fn new(execution_id: i64, policy: Policy, resources: Vec<Resource>) -> Self {
        Self {
            execution_id,
            policy,
            resources,
        }
    }
}

#[async_trait]
impl Flow for DeletionFlow {
    async fn run(&self, ctx: &FlowContext) -> Result<usize> {
        let endpoints = initialize(ctx, &self.policy)?;
        let chain = FilterChain::new(&self.policy.filters)?;

        let resources: Vec<Resource> = self
            .resources
            .iter()
            .cloned()
            .map(|mut r| {
                r.deleted = true;
                r
            })
            .collect();
        let src_resources = filter_resources(resources, &chain, &endpoints.src_registry);
        if src_resources.is_empty() {
            return finish_empty(ctx, self.execution_id).await;
        }
        info!(
            execution_id = self.execution_id,
            policy = %self.policy.name,
            count = src_resources.len(),
            "Resources selected for deletion"
        );

        let dst_resources = assemble_dst_resources(
            endpoints.dst.as_ref(),
            &endpoints.dst_registry,
            &src_resources,
            &self.policy,
        )
        .await;
        schedule_resources(ctx, self.execution_id, src_resources, dst_resources).await
    }
}
