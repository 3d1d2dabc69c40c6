use chrono::{DateTime, Utc};

use super::{ExecutionStatus, Task, TaskCounts, TaskStatus, TaskUpdate};
use crate::replication::jobservice::{JobStatus, JobStatusChange};

/// Check if a task status is terminal (no further transitions allowed)
pub fn is_terminal(status: &TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Succeed | TaskStatus::Failed | TaskStatus::Stopped
    )
}

/// Check if a task state transition is valid
pub fn is_valid_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    use TaskStatus::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,

        (Initialized, Pending) => true,
        // A webhook may arrive before the submission result is recorded
        (Initialized | Pending, Running) => true,

        // Outcomes, including submission failures and stops before start
        (Initialized | Pending | Running, Succeed | Failed | Stopped) => true,

        _ => false,
    }
}

impl From<JobStatus> for TaskStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => TaskStatus::Pending,
            JobStatus::Running => TaskStatus::Running,
            JobStatus::Success => TaskStatus::Succeed,
            JobStatus::Error => TaskStatus::Failed,
            JobStatus::Stopped => TaskStatus::Stopped,
        }
    }
}

/// Compute the update a job status webhook causes, if any.
///
/// Stale revisions, unknown statuses and transitions out of terminal states
/// produce `None`.
pub fn apply_status_change(
    task: &Task,
    change: &JobStatusChange,
    now: DateTime<Utc>,
) -> Option<TaskUpdate> {
    let revision = change.metadata.revision;
    if revision <= task.status_revision {
        return None;
    }
    let status: TaskStatus = change.status.parse::<JobStatus>().ok()?.into();
    if status != task.status && !is_valid_transition(&task.status, &status) {
        return None;
    }
    if is_terminal(&task.status) {
        return None;
    }

    Some(TaskUpdate {
        status,
        status_text: None,
        revision: Some(revision),
        start_time: (status == TaskStatus::Running && task.start_time.is_none()).then_some(now),
        end_time: is_terminal(&status).then_some(now),
    })
}

/// Execution status implied by its task totals, once every task is terminal
pub fn aggregate_status(counts: &TaskCounts) -> Option<ExecutionStatus> {
    if counts.total == 0 || counts.in_progress > 0 {
        return None;
    }
    if counts.failed > 0 {
        Some(ExecutionStatus::Failed)
    } else if counts.stopped > 0 {
        Some(ExecutionStatus::Stopped)
    } else {
        Some(ExecutionStatus::Succeed)
    }
}
