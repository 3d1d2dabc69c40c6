use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::execution::state_machine::is_terminal;
use super::execution::{
    Execution, ExecutionError, ExecutionManager, ExecutionQuery, ExecutionStatus, HookUpdater,
    Task, TaskCounts, TaskQuery, TaskStatus, TaskUpdate,
};
use super::execution::hook::HookOutcome;
use super::flow::{CopyFlow, DeletionFlow, Flow, FlowContext};
use super::jobservice::{JobServiceError, JobStatusChange};
use super::model::Resource;
use super::policy::{Policy, PolicyError, PolicyStore, TriggerType};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("policy {0} not found")]
    PolicyNotFound(i64),

    #[error("policy {0} is disabled")]
    PolicyDisabled(i64),

    #[error("invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    JobService(#[from] JobServiceError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Execution with its task totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub tasks: TaskCounts,
}

/// Entry point for starting, stopping and inspecting replications
pub struct ReplicationController {
    flow: FlowContext,
    policies: Arc<dyn PolicyStore>,
    hooks: HookUpdater,
}

impl ReplicationController {
    pub fn new(flow: FlowContext, policies: Arc<dyn PolicyStore>, hooks: HookUpdater) -> Self {
        Self {
            flow,
            policies,
            hooks,
        }
    }

    pub fn policies(&self) -> &Arc<dyn PolicyStore> {
        &self.policies
    }

    /// Registered adapter types
    pub fn adapter_types(&self) -> Vec<String> {
        self.flow.adapters.list()
    }

    pub async fn get_policy(&self, policy_id: i64) -> Result<Policy, ControllerError> {
        self.policies
            .get(policy_id)
            .await?
            .ok_or(ControllerError::PolicyNotFound(policy_id))
    }

    /// Start a replication of the policy with the given id
    pub async fn start_by_id(
        &self,
        policy_id: i64,
        trigger: TriggerType,
    ) -> Result<i64, ControllerError> {
        let policy = self.get_policy(policy_id).await?;
        self.start_replication(&policy, None, trigger).await
    }

    /// Create an execution and run its flow in the background.
    ///
    /// `resource` is the resource of an event; `None` replicates everything
    /// the policy selects.
    pub async fn start_replication(
        &self,
        policy: &Policy,
        resource: Option<Resource>,
        trigger: TriggerType,
    ) -> Result<i64, ControllerError> {
        let (id, _handle) = self.launch(policy, resource, trigger).await?;
        Ok(id)
    }

    pub(crate) async fn launch(
        &self,
        policy: &Policy,
        resource: Option<Resource>,
        trigger: TriggerType,
    ) -> Result<(i64, JoinHandle<()>), ControllerError> {
        policy.validate()?;
        if !policy.enabled {
            return Err(ControllerError::PolicyDisabled(policy.id));
        }
        if let Some(r) = &resource {
            if r.metadata.vtags.len() != 1 {
                return Err(ControllerError::InvalidResource(format!(
                    "event resource {} must carry exactly one tag, got {}",
                    r.name(),
                    r.metadata.vtags.len()
                )));
            }
        }

        let execution = self
            .flow
            .executions
            .create_execution(policy.id, trigger)
            .await?;
        let execution_id = execution.id;
        info!(execution_id, policy_id = policy.id, trigger = %trigger, "Replication started");

        let flow: Box<dyn Flow> = match resource {
            Some(r) if r.deleted => {
                Box::new(DeletionFlow::new(execution_id, policy.clone(), vec![r]))
            }
            Some(r) => Box::new(CopyFlow::new(execution_id, policy.clone(), Some(vec![r]))),
            None => Box::new(CopyFlow::new(execution_id, policy.clone(), None)),
        };
        let ctx = self.flow.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = flow.run(&ctx).await {
                let text = format!("{:#}", e);
                error!(execution_id, "Replication flow failed: {}", text);
                if let Err(e) = ctx
                    .executions
                    .finish_execution(execution_id, ExecutionStatus::Failed, &text)
                    .await
                {
                    error!(execution_id, "Failed to mark execution failed: {:#}", e);
                }
            }
        });
        Ok((execution_id, handle))
    }

    /// Stop a running execution and every task that has not finished
    pub async fn stop_replication(&self, execution_id: i64) -> Result<(), ControllerError> {
        let execution = self.execution(execution_id).await?;
        if execution.status.is_terminal() {
            info!(execution_id, status = %execution.status, "Execution already finished");
            return Ok(());
        }
        self.flow
            .executions
            .finish_execution(execution_id, ExecutionStatus::Stopped, "")
            .await?;

        let tasks = self
            .flow
            .executions
            .list_tasks(execution_id, &TaskQuery::default())
            .await?;
        for task in tasks.into_iter().filter(|t| !is_terminal(&t.status)) {
            match &task.job_id {
                Some(job_id) => {
                    if let Err(e) = self.flow.scheduler.stop(job_id).await {
                        warn!(
                            execution_id,
                            task_id = task.id,
                            job_id = %job_id,
                            "Failed to stop job: {}",
                            e
                        );
                    }
                }
                None => {
                    let update = TaskUpdate {
                        status: TaskStatus::Stopped,
                        status_text: None,
                        revision: None,
                        start_time: None,
                        end_time: Some(Utc::now()),
                    };
                    self.flow.executions.update_task(task.id, &update).await?;
                }
            }
        }
        info!(execution_id, "Replication stopped");
        Ok(())
    }

    pub async fn list_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<(Vec<ExecutionDetail>, i64), ControllerError> {
        let (executions, total) = self.flow.executions.list_executions(query).await?;
        let mut details = Vec::with_capacity(executions.len());
        for execution in executions {
            details.push(self.detail(execution).await?);
        }
        Ok((details, total))
    }

    pub async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<ExecutionDetail, ControllerError> {
        let execution = self.execution(execution_id).await?;
        self.detail(execution).await
    }

    pub async fn list_tasks(
        &self,
        execution_id: i64,
        query: &TaskQuery,
    ) -> Result<Vec<Task>, ControllerError> {
        self.execution(execution_id).await?;
        Ok(self.flow.executions.list_tasks(execution_id, query).await?)
    }

    pub async fn get_task(&self, execution_id: i64, task_id: i64) -> Result<Task, ControllerError> {
        let task = self
            .flow
            .executions
            .get_task(task_id)
            .await?
            .ok_or(ExecutionError::TaskNotFound(task_id))?;
        if task.execution_id != execution_id {
            return Err(ExecutionError::TaskMismatch {
                execution_id,
                task_id,
            }
            .into());
        }
        Ok(task)
    }

    /// Log of the task's job. Tasks never submitted have an empty log.
    pub async fn get_task_log(
        &self,
        execution_id: i64,
        task_id: i64,
    ) -> Result<String, ControllerError> {
        let task = self.get_task(execution_id, task_id).await?;
        match task.job_id {
            Some(job_id) => Ok(self.flow.scheduler.job_log(&job_id).await?),
            None => Ok(String::new()),
        }
    }

    /// Apply a job status callback to its task
    pub async fn handle_hook(
        &self,
        task_id: i64,
        change: JobStatusChange,
    ) -> Result<HookOutcome, ControllerError> {
        if self.flow.executions.get_task(task_id).await?.is_none() {
            return Err(ExecutionError::TaskNotFound(task_id).into());
        }
        Ok(self.hooks.submit(task_id, change).await?)
    }

    async fn execution(&self, execution_id: i64) -> Result<Execution, ControllerError> {
        Ok(self
            .flow
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or(ExecutionError::ExecutionNotFound(execution_id))?)
    }

    async fn detail(&self, execution: Execution) -> Result<ExecutionDetail, ControllerError> {
        let tasks = self.flow.executions.task_counts(execution.id).await?;
        Ok(ExecutionDetail { execution, tasks })
    }
}
