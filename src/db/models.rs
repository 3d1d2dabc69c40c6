use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::replication::execution::{Execution, Task};

/// Row of `replication_executions`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: i64,
    pub policy_id: i64,
    pub status: String,
    pub status_text: String,
    pub trigger: String,
    pub dry_run: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = anyhow::Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(Execution {
            id: row.id,
            policy_id: row.policy_id,
            status: row
                .status
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Bad status on execution {}", row.id))?,
            status_text: row.status_text,
            trigger: row
                .trigger
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Bad trigger on execution {}", row.id))?,
            dry_run: row.dry_run,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}

/// Row of `replication_tasks`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub execution_id: i64,
    pub status: String,
    pub status_text: String,
    pub status_revision: i64,
    pub resource_type: String,
    pub src_resource: String,
    pub dst_resource: String,
    pub operation: String,
    pub job_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let id = row.id;
        let bad = |field: &'static str| move || format!("Bad {} on task {}", field, id);
        Ok(Task {
            id: row.id,
            execution_id: row.execution_id,
            status: row
                .status
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(bad("status"))?,
            status_text: row.status_text,
            status_revision: row.status_revision,
            resource_type: row
                .resource_type
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(bad("resource type"))?,
            src_resource: row.src_resource,
            dst_resource: row.dst_resource,
            operation: row
                .operation
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(bad("operation"))?,
            job_id: row.job_id,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}
