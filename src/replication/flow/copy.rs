use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{
    assemble_dst_namespaces, assemble_dst_resources, create_namespaces, fetch_resources,
    filter_resources, finish_empty, initialize, schedule_resources, Flow, FlowContext,
};
use crate::replication::filter::FilterChain;
use crate::replication::model::Resource;
use crate::replication::policy::Policy;

/// Copies the policy's resources from source to destination
pub struct CopyFlow {
    execution_id: i64,
    policy: Policy,
    /// Resources from an event; `None` fetches them from the source
    resources: Option<Vec<Resource>>,
}

impl CopyFlow {
    pub fn new(execution_id: i64, policy: Policy, resources: Option<Vec<Resource>>) -> Self {
        Self {
            execution_id,
            policy,
            resources,
        }
    }
}

#[async_trait]
impl Flow for CopyFlow {
    async fn run(&self, ctx: &FlowContext) -> Result<usize> {
        let endpoints = initialize(ctx, &self.policy)?;
        let chain = FilterChain::new(&self.policy.filters)?;

        let resources = match &self.resources {
            Some(resources) => resources.clone(),
            None => fetch_resources(&endpoints, &self.policy, &chain).await?,
        };
        if resources.is_empty() {
            return finish_empty(ctx, self.execution_id).await;
        }

        let src_resources = filter_resources(resources, &chain, &endpoints.src_registry);
        if src_resources.is_empty() {
            return finish_empty(ctx, self.execution_id).await;
        }
        info!(
            execution_id = self.execution_id,
            policy = %self.policy.name,
            count = src_resources.len(),
            "Resources selected for replication"
        );

        let namespaces = assemble_dst_namespaces(
            endpoints.src.as_ref(),
            &src_resources,
            &self.policy.dest_namespace,
        )
        .await?;
        create_namespaces(endpoints.dst.as_ref(), &namespaces).await?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::execution::{ExecutionManager, ExecutionStatus, TaskStatus};
    use crate::replication::flow::NO_RESOURCES_TEXT;
    use crate::replication::model::ResourceType;
    use crate::replication::policy::{Filter, FilterType};
    use crate::replication::testing::{FakeAdapter, FakeJobBackend, Harness};

    fn submitted_dst(backend: &FakeJobBackend) -> Vec<Resource> {
        backend
            .submitted()
            .iter()
            .map(|job| {
                serde_json::from_str(job.parameters["dst_resource"].as_str().unwrap()).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tag_filter_narrows_scheduled_tags() {
        let local = FakeAdapter::with_resources(vec![Resource::repository(
            "lib/app",
            &["release-1.0", "latest"],
        )]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let mut policy = h.push_policy();
        policy.filters = vec![Filter::new(FilterType::Tag, "release-*")];
        let execution = h.execution(&policy).await;

        let submitted = CopyFlow::new(execution, policy, None)
            .run(&h.flow)
            .await
            .unwrap();
        assert_eq!(submitted, 1);

        let dst = submitted_dst(&h.backend);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].metadata.vtags, vec!["release-1.0"]);
        assert_eq!(dst[0].registry.as_ref().unwrap().name, "remote");

        let tasks = h.tasks(execution).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].src_resource, "lib/app:[release-1.0]");
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].job_id.as_deref(), Some("job-1"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_is_send() {
        let h = Harness::new(
            FakeAdapter::default(),
            FakeAdapter::default(),
            FakeJobBackend::default(),
        );
        let flow = CopyFlow::new(1, h.push_policy(), None);
        assert_send(&flow.run(&h.flow));
    }

    #[tokio::test]
    async fn test_stopped_execution_creates_no_tasks() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/app", &["1.0"])]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;
        h.flow
            .executions
            .finish_execution(execution, ExecutionStatus::Stopped, "")
            .await
            .unwrap();

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 0);
        assert!(h.tasks(execution).await.is_empty());
        assert!(h.backend.submitted().is_empty());
        let record = h.flow.executions.get_execution(execution).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_no_resources_succeeds_without_tasks() {
        let h = Harness::new(
            FakeAdapter::default(),
            FakeAdapter::default(),
            FakeJobBackend::default(),
        );
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 0);
        let record = h.flow.executions.get_execution(execution).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeed);
        assert_eq!(record.status_text, NO_RESOURCES_TEXT);
        assert!(h.tasks(execution).await.is_empty());
        assert!(h.backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_everything_filtered_out_succeeds() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/app", &["dev"])]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let mut policy = h.push_policy();
        policy.filters = vec![Filter::new(FilterType::Tag, "release-*")];
        let execution = h.execution(&policy).await;

        CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap();
        let record = h.flow.executions.get_execution(execution).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeed);
    }

    #[tokio::test]
    async fn test_existing_namespace_is_not_an_error() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/app", &["1.0"])]);
        let remote = FakeAdapter::default();
        remote.state.lock().unwrap().namespaces.insert("lib".to_string());
        let h = Harness::new(local, remote, FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 1);
        assert_eq!(h.tasks(execution).await.len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_created_once_with_source_metadata() {
        let local = FakeAdapter::with_resources(vec![
            Resource::repository("lib/a", &["1"]),
            Resource::repository("lib/b", &["1"]),
            Resource::repository("base", &["1"]),
        ]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap();
        assert_eq!(h.remote.writes(), vec!["create_namespace lib"]);
    }

    #[tokio::test]
    async fn test_dest_namespace_override() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/app", &["1"])]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let mut policy = h.push_policy();
        policy.dest_namespace = "mirror".to_string();
        policy.override_existing = true;
        let execution = h.execution(&policy).await;

        CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap();
        assert_eq!(h.remote.writes(), vec!["create_namespace mirror"]);
        let dst = submitted_dst(&h.backend);
        assert_eq!(dst[0].name(), "mirror/app");
        assert!(dst[0].override_existing);
    }

    #[tokio::test]
    async fn test_all_submissions_fail() {
        let local = FakeAdapter::with_resources(vec![
            Resource::repository("lib/a", &["1"]),
            Resource::repository("lib/b", &["1"]),
            Resource::repository("lib/c", &["1"]),
        ]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::failing());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        let err = CopyFlow::new(execution, policy, None)
            .run(&h.flow)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("all tasks are failed"));

        let tasks = h.tasks(execution).await;
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Failed));
        assert!(tasks[0].status_text.contains("cannot run"));
        assert!(tasks.iter().all(|t| t.end_time.is_some()));
    }

    #[tokio::test]
    async fn test_fan_out_creates_one_task_per_resource() {
        let resources: Vec<Resource> = (0..5)
            .map(|i| Resource::repository(&format!("lib/app{}", i), &["1.0"]))
            .collect();
        let h = Harness::new(
            FakeAdapter::with_resources(resources),
            FakeAdapter::default(),
            FakeJobBackend::default(),
        );
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 5);
        let tasks = h.tasks(execution).await;
        assert_eq!(tasks.len(), 5);
        assert_eq!(h.backend.submitted().len(), 5);
        let names: Vec<_> = tasks.iter().map(|t| t.src_resource.clone()).collect();
        assert_eq!(names[0], "lib/app0:[1.0]");
        assert_eq!(names[4], "lib/app4:[1.0]");
    }

    #[tokio::test]
    async fn test_conversion_failure_is_isolated() {
        let local = FakeAdapter::with_resources(vec![
            Resource::repository("lib/good", &["1"]),
            Resource::repository("lib/bad", &["1"]),
        ]);
        let mut remote = FakeAdapter::default();
        remote.reject_names.insert("lib/bad".to_string());
        let h = Harness::new(local, remote, FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 1);
        let tasks = h.tasks(execution).await;
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert!(tasks[1].status_text.contains("cannot convert lib/bad"));
    }

    #[tokio::test]
    async fn test_all_invalid_fails_execution() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/bad", &["1"])]);
        let mut remote = FakeAdapter::default();
        remote.reject_names.insert("lib/bad".to_string());
        let h = Harness::new(local, remote, FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        assert_eq!(CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap(), 0);
        let record = h.flow.executions.get_execution(execution).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(h.backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_event_resources_replace_fetching() {
        let local = FakeAdapter::with_resources(vec![Resource::repository("lib/other", &["1"])]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let policy = h.push_policy();
        let execution = h.execution(&policy).await;

        let event = vec![Resource::repository("lib/app", &["2.0"])];
        CopyFlow::new(execution, policy, Some(event))
            .run(&h.flow)
            .await
            .unwrap();
        let dst = submitted_dst(&h.backend);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].name(), "lib/app");
    }

    #[tokio::test]
    async fn test_unknown_adapter_type_fails_flow() {
        let h = Harness::new(
            FakeAdapter::default(),
            FakeAdapter::default(),
            FakeJobBackend::default(),
        );
        let mut policy = h.push_policy();
        if let Some(r) = policy.dest_registry.as_mut() {
            r.registry_type = "quay".to_string();
        }
        let execution = h.execution(&policy).await;
        let err = CopyFlow::new(execution, policy, None)
            .run(&h.flow)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("no adapter factory"));
    }

    #[tokio::test]
    async fn test_resource_filter_selects_charts() {
        let mut chart = Resource::repository("lib/nginx", &["1.0.0"]);
        chart.resource_type = ResourceType::Chart;
        let local = FakeAdapter::with_resources(vec![
            chart,
            Resource::repository("lib/app", &["1"]),
        ]);
        let h = Harness::new(local, FakeAdapter::default(), FakeJobBackend::default());
        let mut policy = h.push_policy();
        policy.filters = vec![Filter::new(FilterType::Resource, "chart")];
        let execution = h.execution(&policy).await;

        CopyFlow::new(execution, policy, None).run(&h.flow).await.unwrap();
        let tasks = h.tasks(execution).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].resource_type, ResourceType::Chart);
        assert!(h.local.writes().is_empty());
    }
}
