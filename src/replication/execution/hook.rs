use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::state_machine::{apply_status_change, is_terminal};
use super::{refresh_execution_status, ExecutionError, ExecutionManager, TaskStatus};
use crate::replication::jobservice::JobStatusChange;

const QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Applied(TaskStatus),
    /// Stale, duplicate or invalid for the task's current state
    Ignored,
}

struct HookRequest {
    task_id: i64,
    change: JobStatusChange,
    ack: oneshot::Sender<Result<HookOutcome>>,
}

/// Serializes job status webhooks through a single writer task
#[derive(Clone)]
pub struct HookUpdater {
    tx: mpsc::Sender<HookRequest>,
}

impl HookUpdater {
    pub fn spawn(manager: Arc<dyn ExecutionManager>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<HookRequest>(QUEUE_SIZE);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = apply(manager.as_ref(), request.task_id, &request.change).await;
                if let Err(e) = &result {
                    error!(task_id = request.task_id, "Failed to apply status hook: {:#}", e);
                }
                let _ = request.ack.send(result);
            }
            debug!("Hook updater stopped");
        });
        (Self { tx }, handle)
    }

    /// Queue a status change and wait until it has been applied
    pub async fn submit(&self, task_id: i64, change: JobStatusChange) -> Result<HookOutcome> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(HookRequest {
                task_id,
                change,
                ack,
            })
            .await
            .map_err(|_| anyhow!("hook updater is not running"))?;
        done.await
            .map_err(|_| anyhow!("hook updater dropped the request"))?
    }
}

async fn apply(
    manager: &dyn ExecutionManager,
    task_id: i64,
    change: &JobStatusChange,
) -> Result<HookOutcome> {
    let task = manager
        .get_task(task_id)
        .await?
        .ok_or(ExecutionError::TaskNotFound(task_id))?;

    let Some(update) = apply_status_change(&task, change, Utc::now()) else {
        debug!(
            task_id,
            status = %change.status,
            revision = change.metadata.revision,
            current = %task.status,
            "Ignoring status hook"
        );
        return Ok(HookOutcome::Ignored);
    };
    if !manager.update_task(task_id, &update).await? {
        return Ok(HookOutcome::Ignored);
    }
    debug!(task_id, status = %update.status, "Task status updated");

    if is_terminal(&update.status) {
        refresh_execution_status(manager, task.execution_id).await?;
    }
    Ok(HookOutcome::Applied(update.status))
}
