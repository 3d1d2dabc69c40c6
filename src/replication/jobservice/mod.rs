pub mod client;
pub mod local;
pub mod replication;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use client::HttpJobServiceClient;
pub use local::{HttpStatusReporter, LocalJobService, LocalJobServiceConfig, StatusReporter};
pub use replication::ReplicationJob;

use super::transfer::TransferError;

pub const REPLICATION_JOB_NAME: &str = "REPLICATION";
pub const JOB_KIND_GENERIC: &str = "Generic";

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job service returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("job service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("job service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_kind: String,
    pub is_unique: bool,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            job_kind: JOB_KIND_GENERIC.to_string(),
            is_unique: false,
        }
    }
}

/// A unit of work submitted to a job backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub name: String,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub status_hook: String,
}

/// Status values reported by job backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" | "succeed" => Ok(JobStatus::Success),
            "error" | "failed" => Ok(JobStatus::Error),
            "stopped" | "cancelled" => Ok(JobStatus::Stopped),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeMetadata {
    #[serde(default)]
    pub revision: i64,
}

/// Webhook payload posted to a job's status hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusChange {
    #[serde(default)]
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub check_in: String,
    #[serde(default)]
    pub metadata: StatusChangeMetadata,
}

/// Asynchronous work-execution system running transfers
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job and return its id
    async fn submit(&self, job: &JobData) -> Result<String, JobServiceError>;

    /// Best-effort request to stop a running job
    async fn stop(&self, job_id: &str) -> Result<(), JobServiceError>;

    async fn get_log(&self, job_id: &str) -> Result<String, JobServiceError>;
}

/// Per-job log buffer. Lines are also emitted through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct JobLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl JobLog {
    fn push(&self, level: &str, message: String) {
        let line = format!("{} [{}] {}", Utc::now().to_rfc3339(), level, message);
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push("INFO", message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.push("WARNING", message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push("ERROR", message);
    }

    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// What a running job sees of its environment
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub stop: CancellationToken,
    pub log: JobLog,
}

/// Executes jobs of one kind inside a worker
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobData, ctx: &JobContext) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_parse_is_case_insensitive() {
        assert_eq!("Running".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert_eq!("SUCCESS".parse::<JobStatus>(), Ok(JobStatus::Success));
        assert_eq!("failed".parse::<JobStatus>(), Ok(JobStatus::Error));
        assert_eq!("Error".parse::<JobStatus>(), Ok(JobStatus::Error));
        assert_eq!("cancelled".parse::<JobStatus>(), Ok(JobStatus::Stopped));
        assert!("scheduled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_change_defaults() {
        let change: JobStatusChange =
            serde_json::from_str(r#"{"job_id":"j1","status":"Running"}"#).unwrap();
        assert_eq!(change.metadata.revision, 0);
        assert_eq!(change.check_in, "");
    }

    #[test]
    fn test_job_log_contents() {
        let log = JobLog::default();
        assert_eq!(log.contents(), "");
        log.info("first");
        log.clone().warn("second");
        let contents = log.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] first"));
        assert!(lines[1].ends_with("[WARNING] second"));
    }

    #[test]
    fn test_job_data_wire_format() {
        let job = JobData {
            name: REPLICATION_JOB_NAME.to_string(),
            parameters: serde_json::json!({"src_resource": "{}"}),
            metadata: JobMetadata::default(),
            status_hook: "http://core/hook".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["metadata"]["job_kind"], "Generic");
        assert_eq!(value["metadata"]["is_unique"], false);
        assert_eq!(value["name"], "REPLICATION");
    }
}
