use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::state_machine::is_terminal;
use super::{
    Execution, ExecutionError, ExecutionManager, ExecutionQuery, ExecutionStatus, NewTask, Task,
    TaskCounts, TaskQuery, TaskStatus, TaskUpdate,
};
use crate::replication::policy::TriggerType;

#[derive(Default)]
struct Store {
    executions: BTreeMap<i64, Execution>,
    tasks: BTreeMap<i64, Task>,
    last_execution_id: i64,
    last_task_id: i64,
}

/// Execution store kept in process memory
#[derive(Default)]
pub struct InMemoryExecutionManager {
    store: RwLock<Store>,
}

impl InMemoryExecutionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionManager for InMemoryExecutionManager {
    async fn create_execution(&self, policy_id: i64, trigger: TriggerType) -> Result<Execution> {
        let mut store = self.store.write().await;
        store.last_execution_id += 1;
        let execution = Execution {
            id: store.last_execution_id,
            policy_id,
            status: ExecutionStatus::InProgress,
            status_text: String::new(),
            trigger,
            dry_run: false,
            start_time: Utc::now(),
            end_time: None,
        };
        store.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        Ok(self.store.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> Result<(Vec<Execution>, i64)> {
        let store = self.store.read().await;
        let matching: Vec<&Execution> = store
            .executions
            .values()
            .rev()
            .filter(|e| query.matches(e))
            .collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit())
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        status_text: &str,
    ) -> Result<bool> {
        let mut store = self.store.write().await;
        let execution = store
            .executions
            .get_mut(&id)
            .ok_or(ExecutionError::ExecutionNotFound(id))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = status;
        execution.status_text = status_text.to_string();
        if status.is_terminal() {
            execution.end_time = Some(Utc::now());
        }
        Ok(true)
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        let mut store = self.store.write().await;
        if !store.executions.contains_key(&task.execution_id) {
            return Err(ExecutionError::ExecutionNotFound(task.execution_id).into());
        }
        store.last_task_id += 1;
        let task = Task {
            id: store.last_task_id,
            execution_id: task.execution_id,
            status: task.status,
            status_text: task.status_text,
            status_revision: 0,
            resource_type: task.resource_type,
            src_resource: task.src_resource,
            dst_resource: task.dst_resource,
            operation: task.operation,
            job_id: None,
            start_time: None,
            end_time: task.end_time,
        };
        store.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        Ok(self.store.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, execution_id: i64, query: &TaskQuery) -> Result<Vec<Task>> {
        let store = self.store.read().await;
        Ok(store
            .tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn mark_task_submitted(
        &self,
        id: i64,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut store = self.store.write().await;
        let task = store
            .tasks
            .get_mut(&id)
            .ok_or(ExecutionError::TaskNotFound(id))?;
        task.job_id = Some(job_id.to_string());
        if task.status != TaskStatus::Initialized {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.start_time = Some(now);
        Ok(true)
    }

    async fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<bool> {
        let mut store = self.store.write().await;
        let task = store
            .tasks
            .get_mut(&id)
            .ok_or(ExecutionError::TaskNotFound(id))?;
        if is_terminal(&task.status) {
            return Ok(false);
        }
        if let Some(revision) = update.revision {
            if revision <= task.status_revision {
                return Ok(false);
            }
            task.status_revision = revision;
        }
        task.status = update.status;
        if let Some(text) = &update.status_text {
            task.status_text = text.clone();
        }
        if update.start_time.is_some() {
            task.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            task.end_time = update.end_time;
        }
        Ok(true)
    }

    async fn task_counts(&self, execution_id: i64) -> Result<TaskCounts> {
        let store = self.store.read().await;
        let mut counts = TaskCounts::default();
        for task in store.tasks.values().filter(|t| t.execution_id == execution_id) {
            counts.add(task.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::execution::{refresh_execution_status, Operation};
    use crate::replication::model::ResourceType;

    fn new_task(execution_id: i64) -> NewTask {
        NewTask {
            execution_id,
            resource_type: ResourceType::Repository,
            src_resource: "lib/app:[1.0]".to_string(),
            dst_resource: "lib/app:[1.0]".to_string(),
            operation: Operation::Copy,
            status: TaskStatus::Initialized,
            status_text: String::new(),
            end_time: None,
        }
    }

    fn finished(status: TaskStatus) -> TaskUpdate {
        TaskUpdate {
            status,
            status_text: None,
            revision: None,
            start_time: None,
            end_time: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_ids_increase_and_listing_is_newest_first() {
        let manager = InMemoryExecutionManager::new();
        let first = manager.create_execution(1, TriggerType::Manual).await.unwrap();
        let second = manager
            .create_execution(2, TriggerType::Scheduled)
            .await
            .unwrap();
        assert!(second.id > first.id);

        let (all, total) = manager
            .list_executions(&ExecutionQuery::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(all[0].id, second.id);

        let query = ExecutionQuery {
            trigger: Some(TriggerType::Manual),
            ..Default::default()
        };
        let (manual, total) = manager.list_executions(&query).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(manual[0].policy_id, 1);
    }

    #[tokio::test]
    async fn test_submission_only_moves_initialized_tasks() {
        let manager = InMemoryExecutionManager::new();
        let execution = manager.create_execution(1, TriggerType::Manual).await.unwrap();
        let task = manager.create_task(new_task(execution.id)).await.unwrap();

        let running = TaskUpdate {
            status: TaskStatus::Running,
            status_text: None,
            revision: Some(1),
            start_time: Some(Utc::now()),
            end_time: None,
        };
        assert!(manager.update_task(task.id, &running).await.unwrap());
        assert!(!manager
            .mark_task_submitted(task.id, "job-1", Utc::now())
            .await
            .unwrap());

        let task = manager.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn test_stale_revision_is_not_written() {
        let manager = InMemoryExecutionManager::new();
        let execution = manager.create_execution(1, TriggerType::Manual).await.unwrap();
        let task = manager.create_task(new_task(execution.id)).await.unwrap();

        let mut update = finished(TaskStatus::Succeed);
        update.revision = Some(3);
        assert!(manager.update_task(task.id, &update).await.unwrap());
        update.status = TaskStatus::Failed;
        update.revision = Some(2);
        assert!(!manager.update_task(task.id, &update).await.unwrap());
        assert_eq!(
            manager.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Succeed
        );
    }

    #[tokio::test]
    async fn test_refresh_waits_for_all_tasks() {
        let manager = InMemoryExecutionManager::new();
        let execution = manager.create_execution(1, TriggerType::Manual).await.unwrap();
        let a = manager.create_task(new_task(execution.id)).await.unwrap();
        let b = manager.create_task(new_task(execution.id)).await.unwrap();

        manager
            .update_task(a.id, &finished(TaskStatus::Failed))
            .await
            .unwrap();
        assert_eq!(refresh_execution_status(&manager, execution.id).await.unwrap(), None);

        manager
            .update_task(b.id, &finished(TaskStatus::Succeed))
            .await
            .unwrap();
        assert_eq!(
            refresh_execution_status(&manager, execution.id).await.unwrap(),
            Some(ExecutionStatus::Failed)
        );
        let execution = manager.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.status_text, "1 of 2 tasks failed");
        assert!(execution.end_time.is_some());

        // idempotent
        assert_eq!(refresh_execution_status(&manager, execution.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stopped_execution_is_not_overwritten() {
        let manager = InMemoryExecutionManager::new();
        let execution = manager.create_execution(1, TriggerType::Manual).await.unwrap();
        assert!(manager
            .finish_execution(execution.id, ExecutionStatus::Stopped, "")
            .await
            .unwrap());
        assert!(!manager
            .finish_execution(execution.id, ExecutionStatus::Succeed, "")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_task_for_unknown_execution() {
        let manager = InMemoryExecutionManager::new();
        let err = manager.create_task(new_task(99)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExecutionError>(),
            Some(ExecutionError::ExecutionNotFound(99))
        ));
    }
}
