use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::{ExecutionRow, TaskRow};
use crate::replication::execution::{
    Execution, ExecutionError, ExecutionManager, ExecutionQuery, ExecutionStatus, NewTask, Task,
    TaskCounts, TaskQuery, TaskStatus, TaskUpdate,
};
use crate::replication::policy::TriggerType;

const EXECUTION_COLUMNS: &str =
    "id, policy_id, status, status_text, trigger, dry_run, start_time, end_time";

const TASK_COLUMNS: &str = "id, execution_id, status, status_text, status_revision, \
     resource_type, src_resource, dst_resource, operation, job_id, start_time, end_time";

/// Execution store backed by PostgreSQL.
///
/// Status transitions are conditional updates, so concurrent writers in
/// different processes cannot move a task backwards.
#[derive(Clone)]
pub struct PgExecutionManager {
    pool: PgPool,
}

impl PgExecutionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn task_exists(&self, id: i64) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM replication_tasks WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to look up task")?;
        Ok(exists)
    }
}

#[async_trait]
impl ExecutionManager for PgExecutionManager {
    async fn create_execution(&self, policy_id: i64, trigger: TriggerType) -> Result<Execution> {
        let row: ExecutionRow = sqlx::query_as(&format!(
            "INSERT INTO replication_executions (policy_id, trigger) VALUES ($1, $2) RETURNING {}",
            EXECUTION_COLUMNS
        ))
        .bind(policy_id)
        .bind(trigger.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to create execution")?;
        row.try_into()
    }

    async fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_executions WHERE id = $1",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch execution")?;
        row.map(Execution::try_from).transpose()
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> Result<(Vec<Execution>, i64)> {
        const FILTER: &str = "($1::BIGINT IS NULL OR policy_id = $1) \
             AND ($2::TEXT IS NULL OR status = $2) \
             AND ($3::TEXT IS NULL OR trigger = $3)";
        let status = query.status.map(|s| s.as_str());
        let trigger = query.trigger.map(|t| t.as_str());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM replication_executions WHERE {}",
            FILTER
        ))
        .bind(query.policy_id)
        .bind(status)
        .bind(trigger)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count executions")?;

        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_executions WHERE {} ORDER BY id DESC LIMIT $4 OFFSET $5",
            EXECUTION_COLUMNS, FILTER
        ))
        .bind(query.policy_id)
        .bind(status)
        .bind(trigger)
        .bind(query.limit() as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        let executions = rows
            .into_iter()
            .map(Execution::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((executions, total))
    }

    async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        status_text: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replication_executions
            SET status = $2,
                status_text = $3,
                end_time = CASE WHEN $2 = 'InProgress' THEN end_time ELSE NOW() END
            WHERE id = $1 AND status = 'InProgress'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(status_text)
        .execute(&self.pool)
        .await
        .context("Failed to update execution status")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.get_execution(id).await?.is_none() {
            return Err(ExecutionError::ExecutionNotFound(id).into());
        }
        Ok(false)
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        let row: TaskRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO replication_tasks
                (execution_id, status, status_text, resource_type, src_resource, dst_resource,
                 operation, end_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task.execution_id)
        .bind(task.status.as_str())
        .bind(&task.status_text)
        .bind(task.resource_type.as_str())
        .bind(&task.src_resource)
        .bind(&task.dst_resource)
        .bind(task.operation.as_str())
        .bind(task.end_time)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create task for execution {}", task.execution_id))?;
        row.try_into()
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch task")?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, execution_id: i64, query: &TaskQuery) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_tasks \
             WHERE execution_id = $1 AND ($2::TEXT IS NULL OR status = $2) ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(execution_id)
        .bind(query.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tasks")?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn mark_task_submitted(
        &self,
        id: i64,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let moved = sqlx::query(
            r#"
            UPDATE replication_tasks
            SET job_id = $2, status = 'Pending', start_time = $3
            WHERE id = $1 AND status = 'Initialized'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark task submitted")?;
        if moved.rows_affected() > 0 {
            return Ok(true);
        }

        // A hook may already have advanced the task; keep its status
        let updated = sqlx::query("UPDATE replication_tasks SET job_id = $2 WHERE id = $1")
            .bind(id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to record job id")?;
        if updated.rows_affected() == 0 {
            return Err(ExecutionError::TaskNotFound(id).into());
        }
        Ok(false)
    }

    async fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replication_tasks
            SET status = $2,
                status_text = COALESCE($3, status_text),
                status_revision = COALESCE($4, status_revision),
                start_time = COALESCE($5, start_time),
                end_time = COALESCE($6, end_time)
            WHERE id = $1
              AND status NOT IN ('Succeed', 'Failed', 'Stopped')
              AND ($4::BIGINT IS NULL OR status_revision < $4)
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.status_text.as_deref())
        .bind(update.revision)
        .bind(update.start_time)
        .bind(update.end_time)
        .execute(&self.pool)
        .await
        .context("Failed to update task")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.task_exists(id).await? {
            return Err(ExecutionError::TaskNotFound(id).into());
        }
        Ok(false)
    }

    async fn task_counts(&self, execution_id: i64) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM replication_tasks WHERE execution_id = $1 GROUP BY status",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count tasks")?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            let status: TaskStatus = status.parse().map_err(anyhow::Error::msg)?;
            counts.add_many(status, n);
        }
        Ok(counts)
    }
}
