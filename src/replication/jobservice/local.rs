use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::sync::Cache;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    JobBackend, JobContext, JobData, JobRunner, JobServiceError, JobStatus, JobStatusChange,
    StatusChangeMetadata,
};
use crate::replication::transfer::TransferError;

#[derive(Debug, Clone)]
pub struct LocalJobServiceConfig {
    pub max_workers: usize,
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff
    pub retry_backoff: Duration,
    /// Per-attempt limit; `None` means unbounded
    pub timeout: Option<Duration>,
    /// How long a finished job's log stays readable
    pub finished_ttl: Duration,
    /// Finished jobs kept at most
    pub max_finished: u64,
}

impl Default for LocalJobServiceConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            timeout: None,
            finished_ttl: Duration::from_secs(3600),
            max_finished: 1000,
        }
    }
}

/// Delivers job status changes to the job's status hook
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, hook_url: &str, change: &JobStatusChange) -> Result<()>;
}

/// Posts status changes over HTTP with the shared hook secret
pub struct HttpStatusReporter {
    http: reqwest::Client,
    secret: Option<String>,
}

impl HttpStatusReporter {
    pub fn new(http: reqwest::Client, secret: Option<String>) -> Self {
        Self {
            http,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(&self, hook_url: &str, change: &JobStatusChange) -> Result<()> {
        let mut request = self.http.post(hook_url).json(change);
        if let Some(secret) = &self.secret {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Harbor-Secret {}", secret),
            );
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to post status hook {}", hook_url))?;
        if !response.status().is_success() {
            anyhow::bail!("Status hook {} returned {}", hook_url, response.status());
        }
        Ok(())
    }
}

/// Contexts of queued and running jobs, and a bounded cache of finished ones
struct JobTable {
    active: RwLock<HashMap<String, JobContext>>,
    finished: Cache<String, JobContext>,
}

impl JobTable {
    fn new(config: &LocalJobServiceConfig) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            finished: Cache::builder()
                .time_to_live(config.finished_ttl)
                .max_capacity(config.max_finished)
                .build(),
        }
    }

    fn insert(&self, job_id: &str, ctx: JobContext) {
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), ctx);
    }

    fn get(&self, job_id: &str) -> Option<JobContext> {
        let active = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned();
        active.or_else(|| self.finished.get(job_id))
    }

    /// Move a job to the finished cache
    fn finish(&self, job_id: &str) {
        let ctx = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned();
        if let Some(ctx) = ctx {
            self.finished.insert(job_id.to_string(), ctx);
        }
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    fn active_len(&self) -> usize {
        self.active.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// In-process job backend: a bounded worker pool with retries
pub struct LocalJobService {
    config: LocalJobServiceConfig,
    runners: HashMap<String, Arc<dyn JobRunner>>,
    reporter: Arc<dyn StatusReporter>,
    workers: Arc<Semaphore>,
    jobs: Arc<JobTable>,
}

impl LocalJobService {
    pub fn new(config: LocalJobServiceConfig, reporter: Arc<dyn StatusReporter>) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let jobs = Arc::new(JobTable::new(&config));
        Self {
            config,
            runners: HashMap::new(),
            reporter,
            workers,
            jobs,
        }
    }

    /// Register the runner executing jobs named `name`
    pub fn with_runner(mut self, name: &str, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.insert(name.to_string(), runner);
        self
    }

    fn context(&self, job_id: &str) -> Result<JobContext, JobServiceError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| JobServiceError::NotFound(job_id.to_string()))
    }
}

/// Backoff before retry number `attempt` (0-based): base * 2^attempt plus
/// up to half the base as jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_ms = (base.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

struct Worker {
    job_id: String,
    job: JobData,
    ctx: JobContext,
    runner: Arc<dyn JobRunner>,
    reporter: Arc<dyn StatusReporter>,
    config: LocalJobServiceConfig,
    jobs: Arc<JobTable>,
    revision: i64,
}

impl Worker {
    async fn report(&mut self, status: JobStatus) {
        self.revision += 1;
        let change = JobStatusChange {
            job_id: self.job_id.clone(),
            status: status.as_str().to_string(),
            check_in: String::new(),
            metadata: StatusChangeMetadata {
                revision: self.revision,
            },
        };
        if let Err(e) = self.reporter.report(&self.job.status_hook, &change).await {
            warn!(job_id = %self.job_id, status = %status, "Failed to report job status: {:#}", e);
        }
    }

    async fn attempt(&self) -> Result<(), TransferError> {
        let run = self.runner.run(&self.job, &self.ctx);
        match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout(limit.as_secs())),
            },
            None => run.await,
        }
    }

    async fn execute(&self) -> JobStatus {
        let mut attempt = 0;
        loop {
            self.ctx.log.info(format!(
                "Starting {} job {} (attempt {})",
                self.job.name,
                self.job_id,
                attempt + 1
            ));
            match self.attempt().await {
                Ok(()) => {
                    self.ctx.log.info("Job finished successfully");
                    return JobStatus::Success;
                }
                Err(TransferError::Stopped) => {
                    self.ctx.log.info("Job stopped");
                    return JobStatus::Stopped;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = retry_delay(self.config.retry_backoff, attempt);
                    self.ctx.log.warn(format!(
                        "Attempt {} failed: {}; retrying in {}ms",
                        attempt + 1,
                        e,
                        delay.as_millis()
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.ctx.stop.cancelled() => {
                            self.ctx.log.info("Job stopped while waiting to retry");
                            return JobStatus::Stopped;
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    self.ctx.log.error(format!("Job failed: {}", e));
                    return JobStatus::Error;
                }
            }
        }
    }

    async fn run(mut self, workers: Arc<Semaphore>) {
        let permit = tokio::select! {
            permit = workers.acquire_owned() => permit,
            _ = self.ctx.stop.cancelled() => {
                self.ctx.log.info("Job stopped before it started");
                self.jobs.finish(&self.job_id);
                self.report(JobStatus::Stopped).await;
                return;
            }
        };
        let Ok(_permit) = permit else {
            self.ctx.log.error("Worker pool is closed");
            self.jobs.finish(&self.job_id);
            self.report(JobStatus::Error).await;
            return;
        };

        self.report(JobStatus::Running).await;
        let status = self.execute().await;
        info!(job_id = %self.job_id, status = %status, "Job finished");
        self.jobs.finish(&self.job_id);
        self.report(status).await;
    }
}

#[async_trait]
impl JobBackend for LocalJobService {
    async fn submit(&self, job: &JobData) -> Result<String, JobServiceError> {
        let runner = self.runners.get(&job.name).cloned().ok_or_else(|| {
            JobServiceError::Unavailable(format!("no runner for job '{}'", job.name))
        })?;

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let ctx = JobContext::default();
        self.jobs.insert(&job_id, ctx.clone());

        let worker = Worker {
            job_id: job_id.clone(),
            job: job.clone(),
            ctx,
            runner,
            reporter: self.reporter.clone(),
            config: self.config.clone(),
            jobs: self.jobs.clone(),
            revision: 0,
        };
        tokio::spawn(worker.run(self.workers.clone()));
        debug!(job_id = %job_id, name = %job.name, "Queued local job");
        Ok(job_id)
    }

    async fn stop(&self, job_id: &str) -> Result<(), JobServiceError> {
        self.context(job_id)?.stop.cancel();
        info!(job_id = %job_id, "Stop requested for job");
        Ok(())
    }

    async fn get_log(&self, job_id: &str) -> Result<String, JobServiceError> {
        Ok(self.context(job_id)?.log.contents())
    }
}
