//! Cron triggers for policies with a `scheduled` trigger.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::replication::controller::ReplicationController;
use crate::replication::policy::{Policy, TriggerType};

/// Policies to schedule, with their normalized cron expressions
pub fn scheduled_policies(policies: &[Policy]) -> Vec<(i64, String)> {
    policies
        .iter()
        .filter(|p| p.enabled && p.trigger_type() == TriggerType::Scheduled)
        .filter_map(|p| match p.trigger.as_ref().and_then(|t| t.cron()) {
            Some(cron) => Some((p.id, cron)),
            None => {
                warn!(policy_id = p.id, "Scheduled policy without cron expression");
                None
            }
        })
        .collect()
}

/// Running cron jobs, one per scheduled policy
pub struct ScheduledTriggers {
    scheduler: JobScheduler,
    jobs: Vec<(i64, Uuid)>,
}

impl ScheduledTriggers {
    /// Register a cron job for every scheduled policy
    pub async fn new(controller: Arc<ReplicationController>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        let policies = controller.policies().list().await?;

        let mut jobs = Vec::new();
        for (policy_id, cron) in scheduled_policies(&policies) {
            let controller = controller.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let controller = controller.clone();
                Box::pin(async move {
                    match controller
                        .start_by_id(policy_id, TriggerType::Scheduled)
                        .await
                    {
                        Ok(execution_id) => {
                            info!(policy_id, execution_id, "Scheduled replication started")
                        }
                        Err(e) => error!(policy_id, "Scheduled replication failed to start: {}", e),
                    }
                })
            })
            .with_context(|| format!("Invalid cron '{}' on policy {}", cron, policy_id))?;
            let job_id = scheduler
                .add(job)
                .await
                .with_context(|| format!("Failed to schedule policy {}", policy_id))?;
            info!(policy_id, cron = %cron, "Scheduled replication registered");
            jobs.push((policy_id, job_id));
        }

        Ok(Self { scheduler, jobs })
    }

    pub fn jobs(&self) -> &[(i64, Uuid)] {
        &self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Ok(());
        }
        self.scheduler
            .start()
            .await
            .context("Failed to start job scheduler")
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("Failed to stop job scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::controller::tests::controller;
    use crate::replication::policy::tests::push_policy;
    use crate::replication::policy::{Trigger, TriggerSettings};
    use crate::replication::testing::{FakeAdapter, FakeJobBackend, Harness};

    fn scheduled(policy: Policy, cron: &str) -> Policy {
        Policy {
            trigger: Some(Trigger {
                trigger_type: TriggerType::Scheduled,
                settings: Some(TriggerSettings {
                    cron: cron.to_string(),
                }),
            }),
            ..policy
        }
    }

    #[test]
    fn test_scheduled_policies() {
        let manual = push_policy();
        let hourly = scheduled(Policy { id: 2, ..push_policy() }, "0 0 * * * *");
        let disabled = Policy {
            id: 3,
            enabled: false,
            ..hourly.clone()
        };

        let selected = scheduled_policies(&[manual, hourly, disabled]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registers_one_job_per_scheduled_policy() {
        let h = Harness::new(
            FakeAdapter::default(),
            FakeAdapter::default(),
            FakeJobBackend::default(),
        );
        let policies = vec![
            h.push_policy(),
            scheduled(Policy { id: 2, ..h.push_policy() }, "0 0 * * * *"),
        ];
        let triggers = ScheduledTriggers::new(Arc::new(controller(&h, policies)))
            .await
            .unwrap();
        assert_eq!(triggers.jobs().len(), 1);
        assert_eq!(triggers.jobs()[0].0, 2);
    }
}
