pub mod hook;
pub mod memory;
pub mod state_machine;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use hook::HookUpdater;
pub use memory::InMemoryExecutionManager;

use super::model::ResourceType;
use super::policy::TriggerType;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution {0} not found")]
    ExecutionNotFound(i64),
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("task {task_id} does not belong to execution {execution_id}")]
    TaskMismatch { execution_id: i64, task_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    InProgress,
    Succeed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "InProgress",
            ExecutionStatus::Succeed => "Succeed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::InProgress)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(ExecutionStatus::InProgress),
            "Succeed" => Ok(ExecutionStatus::Succeed),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Stopped" => Ok(ExecutionStatus::Stopped),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Initialized,
    Pending,
    Running,
    Succeed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Initialized => "Initialized",
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Succeed => "Succeed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initialized" => Ok(TaskStatus::Initialized),
            "Pending" => Ok(TaskStatus::Pending),
            "Running" => Ok(TaskStatus::Running),
            "Succeed" => Ok(TaskStatus::Succeed),
            "Failed" => Ok(TaskStatus::Failed),
            "Stopped" => Ok(TaskStatus::Stopped),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Copy,
    Deletion,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Deletion => "deletion",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Operation::Copy),
            "deletion" => Ok(Operation::Deletion),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// Record of one flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub policy_id: i64,
    pub status: ExecutionStatus,
    pub status_text: String,
    pub trigger: TriggerType,
    pub dry_run: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Task totals of one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: i64,
    pub failed: i64,
    pub succeed: i64,
    pub in_progress: i64,
    pub stopped: i64,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus) {
        self.add_many(status, 1);
    }

    pub fn add_many(&mut self, status: TaskStatus, n: i64) {
        self.total += n;
        match status {
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Succeed => self.succeed += n,
            TaskStatus::Stopped => self.stopped += n,
            TaskStatus::Initialized | TaskStatus::Pending | TaskStatus::Running => {
                self.in_progress += n
            }
        }
    }
}

/// Record of one scheduled resource pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub execution_id: i64,
    pub status: TaskStatus,
    pub status_text: String,
    pub status_revision: i64,
    pub resource_type: ResourceType,
    pub src_resource: String,
    pub dst_resource: String,
    pub operation: Operation,
    pub job_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Values for a task about to be created
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub execution_id: i64,
    pub resource_type: ResourceType,
    pub src_resource: String,
    pub dst_resource: String,
    pub operation: Operation,
    pub status: TaskStatus,
    pub status_text: String,
    pub end_time: Option<DateTime<Utc>>,
}

/// Status change to write to a task.
///
/// With a revision, the store only applies it when the stored revision is
/// lower. Without one, it applies to any non-terminal task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub status_text: Option<String>,
    pub revision: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionQuery {
    #[serde(default)]
    pub policy_id: Option<i64>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub trigger: Option<TriggerType>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    15
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            policy_id: None,
            status: None,
            trigger: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl ExecutionQuery {
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit()
    }

    pub fn limit(&self) -> usize {
        self.page_size.clamp(1, 100) as usize
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.policy_id.map_or(true, |p| execution.policy_id == p)
            && self.status.map_or(true, |s| execution.status == s)
            && self.trigger.map_or(true, |t| execution.trigger == t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

/// Persistence of executions and tasks
#[async_trait]
pub trait ExecutionManager: Send + Sync {
    async fn create_execution(&self, policy_id: i64, trigger: TriggerType) -> Result<Execution>;

    async fn get_execution(&self, id: i64) -> Result<Option<Execution>>;

    /// Matching executions, newest first, and the total before paging
    async fn list_executions(&self, query: &ExecutionQuery) -> Result<(Vec<Execution>, i64)>;

    /// Move an in-progress execution to a terminal status. Returns false when
    /// the execution had already finished.
    async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        status_text: &str,
    ) -> Result<bool>;

    async fn create_task(&self, task: NewTask) -> Result<Task>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    /// Tasks of an execution in creation order
    async fn list_tasks(&self, execution_id: i64, query: &TaskQuery) -> Result<Vec<Task>>;

    /// Record the job id of a submitted task. The status moves to Pending only
    /// while the task is still Initialized.
    async fn mark_task_submitted(&self, id: i64, job_id: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Apply a status change; returns whether it was written
    async fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool>;

    async fn task_counts(&self, execution_id: i64) -> Result<TaskCounts>;
}

/// Recompute an execution's status from its tasks.
///
/// Only an in-progress execution whose tasks are all terminal changes.
pub async fn refresh_execution_status(
    manager: &dyn ExecutionManager,
    execution_id: i64,
) -> Result<Option<ExecutionStatus>> {
    let Some(execution) = manager.get_execution(execution_id).await? else {
        return Ok(None);
    };
    if execution.status.is_terminal() {
        return Ok(None);
    }
    let counts = manager.task_counts(execution_id).await?;
    let Some(status) = state_machine::aggregate_status(&counts) else {
        return Ok(None);
    };
    let text = match status {
        ExecutionStatus::Failed => format!("{} of {} tasks failed", counts.failed, counts.total),
        ExecutionStatus::Stopped => format!("{} of {} tasks stopped", counts.stopped, counts.total),
        _ => String::new(),
    };
    if manager.finish_execution(execution_id, status, &text).await? {
        tracing::info!(execution_id, status = %status, "Execution finished");
        Ok(Some(status))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            TaskStatus::Initialized,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("Stopped".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Stopped));
        assert_eq!("deletion".parse::<Operation>(), Ok(Operation::Deletion));
    }

    #[test]
    fn test_task_counts() {
        let mut counts = TaskCounts::default();
        for s in [TaskStatus::Pending, TaskStatus::Failed, TaskStatus::Succeed] {
            counts.add(s);
        }
        assert_eq!(
            counts,
            TaskCounts {
                total: 3,
                failed: 1,
                succeed: 1,
                in_progress: 1,
                stopped: 0
            }
        );
    }

    #[test]
    fn test_query_paging() {
        let query = ExecutionQuery {
            page: 3,
            page_size: 10,
            ..Default::default()
        };
        assert_eq!(query.offset(), 20);
        assert_eq!(query.limit(), 10);

        let query = ExecutionQuery {
            page: 0,
            page_size: 1000,
            ..Default::default()
        };
        assert_eq!(query.offset(), 0);
        assert_eq!(query.limit(), 100);
    }
}
