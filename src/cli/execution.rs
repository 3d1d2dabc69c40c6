use anyhow::Result;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};
use serde::Deserialize;
use serde_json::json;

use super::ApiClient;
use crate::replication::controller::ExecutionDetail;
use crate::replication::execution::{ExecutionStatus, Task, TaskStatus};

#[derive(Debug, Clone, clap::Subcommand)]
pub enum ExecutionCommands {
    /// Start a manual replication of a policy
    Start {
        /// Policy ID
        policy_id: i64,
    },
    /// List replication executions, newest first
    #[command(visible_alias = "ls")]
    List {
        /// Only executions of this policy
        #[arg(long)]
        policy: Option<i64>,
        /// Only executions with this status (InProgress, Succeed, Failed, Stopped)
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "15")]
        page_size: u32,
    },
    /// Show an execution and its task totals
    Show {
        /// Execution ID
        id: i64,
    },
    /// Stop a running execution
    Stop {
        /// Execution ID
        id: i64,
    },
    /// List the tasks of an execution
    Tasks {
        /// Execution ID
        id: i64,
        /// Only tasks with this status
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Print the job log of a task
    Log {
        /// Execution ID
        id: i64,
        /// Task ID
        task_id: i64,
    },
}

#[derive(Debug, Deserialize)]
struct ExecutionList {
    total: i64,
    executions: Vec<ExecutionDetail>,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    id: i64,
}

pub async fn handle_execution_command(client: &ApiClient, cmd: ExecutionCommands) -> Result<()> {
    match cmd {
        ExecutionCommands::Start { policy_id } => {
            let response: StartResponse = client
                .post("/executions", &json!({ "policy_id": policy_id }))
                .await?
                .json()
                .await?;
            println!("✓ Started execution {} of policy {}", response.id, policy_id);
        }
        ExecutionCommands::List {
            policy,
            status,
            page,
            page_size,
        } => {
            let path = list_path(policy, status, page, page_size);
            let list: ExecutionList = client.get(&path).await?;
            if list.executions.is_empty() {
                println!("No executions found.");
            } else {
                println!("{}", execution_table(&list.executions));
                println!("Showing {} of {} executions", list.executions.len(), list.total);
            }
        }
        ExecutionCommands::Show { id } => {
            let detail: ExecutionDetail = client.get(&format!("/executions/{}", id)).await?;
            print_execution(&detail);
        }
        ExecutionCommands::Stop { id } => {
            client
                .post(&format!("/executions/{}/stop", id), &json!({}))
                .await?;
            println!("✓ Stopped execution {}", id);
        }
        ExecutionCommands::Tasks { id, status } => {
            let mut path = format!("/executions/{}/tasks", id);
            if let Some(status) = status {
                path.push_str(&format!("?status={}", status));
            }
            let tasks: Vec<Task> = client.get(&path).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!("{}", task_table(&tasks));
            }
        }
        ExecutionCommands::Log { id, task_id } => {
            let log = client
                .get_text(&format!("/executions/{}/tasks/{}/log", id, task_id))
                .await?;
            print!("{}", log);
        }
    }
    Ok(())
}

fn list_path(
    policy: Option<i64>,
    status: Option<ExecutionStatus>,
    page: u32,
    page_size: u32,
) -> String {
    let mut path = format!("/executions?page={}&page_size={}", page, page_size);
    if let Some(policy) = policy {
        path.push_str(&format!("&policy_id={}", policy));
    }
    if let Some(status) = status {
        path.push_str(&format!("&status={}", status));
    }
    path
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn execution_table(executions: &[ExecutionDetail]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&[
            "ID", "POLICY", "STATUS", "TRIGGER", "TASKS", "SUCCEED", "FAILED", "STARTED",
        ]));
    for detail in executions {
        let e = &detail.execution;
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(e.policy_id),
            Cell::new(e.status),
            Cell::new(e.trigger),
            Cell::new(detail.tasks.total),
            Cell::new(detail.tasks.succeed),
            Cell::new(detail.tasks.failed),
            Cell::new(e.start_time.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table
}

fn task_table(tasks: &[Task]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&[
            "ID", "TYPE", "OPERATION", "SOURCE", "DESTINATION", "STATUS", "JOB",
        ]));
    for task in tasks {
        table.add_row(vec![
            Cell::new(task.id),
            Cell::new(task.resource_type),
            Cell::new(task.operation.as_str()),
            Cell::new(&task.src_resource),
            Cell::new(&task.dst_resource),
            Cell::new(task.status),
            Cell::new(task.job_id.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

fn print_execution(detail: &ExecutionDetail) {
    let e = &detail.execution;
    println!("Execution {}", e.id);
    println!("  Policy:   {}", e.policy_id);
    println!("  Status:   {}", e.status);
    if !e.status_text.is_empty() {
        println!("  Message:  {}", e.status_text);
    }
    println!("  Trigger:  {}", e.trigger);
    println!("  Started:  {}", e.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(end) = e.end_time {
        println!("  Finished: {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    let t = &detail.tasks;
    println!(
        "  Tasks:    {} total, {} succeed, {} failed, {} in progress, {} stopped",
        t.total, t.succeed, t.failed, t.in_progress, t.stopped
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::serve;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use reqwest::Client;
    use serde_json::Value;

    #[test]
    fn test_list_path() {
        assert_eq!(list_path(None, None, 1, 15), "/executions?page=1&page_size=15");
        assert_eq!(
            list_path(Some(3), Some(ExecutionStatus::InProgress), 2, 10),
            "/executions?page=2&page_size=10&policy_id=3&status=InProgress"
        );
    }

    #[tokio::test]
    async fn test_start_and_list() {
        let router = Router::new()
            .route(
                "/api/v1/replication/executions",
                post(|Json(body): Json<Value>| async move {
                    (StatusCode::CREATED, Json(json!({"id": body["policy_id"]})))
                })
                .get(|| async {
                    Json(json!({
                        "total": 1,
                        "executions": [{
                            "id": 4, "policy_id": 1, "status": "Succeed", "status_text": "",
                            "trigger": "manual", "dry_run": false,
                            "start_time": "2026-01-01T00:00:00Z", "end_time": null,
                            "tasks": {"total": 2, "failed": 0, "succeed": 2,
                                      "in_progress": 0, "stopped": 0}
                        }]
                    }))
                }),
            )
            .route(
                "/api/v1/replication/executions/{id}/stop",
                post(|Path(id): Path<i64>| async move {
                    if id == 4 {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/api/v1/replication/executions/{id}/tasks/{task}/log",
                get(|| async { "copied\n" }),
            );
        let client = ApiClient::new(Client::new(), &serve(router).await);

        handle_execution_command(&client, ExecutionCommands::Start { policy_id: 9 })
            .await
            .unwrap();

        let list: ExecutionList = client.get(&list_path(None, None, 1, 15)).await.unwrap();
        assert_eq!(list.total, 1);
        assert_eq!(list.executions[0].tasks.succeed, 2);
        assert!(execution_table(&list.executions).to_string().contains("Succeed"));

        handle_execution_command(&client, ExecutionCommands::Stop { id: 4 })
            .await
            .unwrap();
        assert!(handle_execution_command(&client, ExecutionCommands::Stop { id: 5 })
            .await
            .is_err());

        let log = client.get_text("/executions/4/tasks/1/log").await.unwrap();
        assert_eq!(log, "copied\n");
    }
}
