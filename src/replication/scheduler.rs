use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::jobservice::replication::replication_parameters;
use super::jobservice::{JobBackend, JobData, JobMetadata, JobServiceError, REPLICATION_JOB_NAME};
use super::model::Resource;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{src} source resources but {dst} destination resources")]
    LengthMismatch { src: usize, dst: usize },
}

/// A source resource paired with its destination
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleItem {
    pub task_id: i64,
    pub src_resource: Resource,
    pub dst_resource: Resource,
}

impl ScheduleItem {
    pub fn invalid_reason(&self) -> Option<&str> {
        self.dst_resource.invalid.as_deref()
    }
}

#[derive(Debug)]
pub struct ScheduleResult {
    pub task_id: i64,
    pub result: Result<String, JobServiceError>,
}

/// Why a pair cannot be scheduled, if it cannot
fn validate_pair(src: &Resource, dst: &Resource) -> Option<String> {
    if let Some(reason) = dst.invalid.as_ref().or(src.invalid.as_ref()) {
        return Some(reason.clone());
    }
    let src_tags = &src.metadata.vtags;
    let dst_tags = &dst.metadata.vtags;
    if src_tags.len() != dst_tags.len() {
        return Some(format!(
            "tag count mismatch: {} source tags, {} destination tags",
            src_tags.len(),
            dst_tags.len()
        ));
    }
    if src_tags != dst_tags {
        let mut a = src_tags.clone();
        let mut b = dst_tags.clone();
        a.sort();
        b.sort();
        if a == b {
            return Some("destination tags are reordered relative to the source".to_string());
        }
    }
    if !dst.deleted && src_tags.is_empty() {
        return Some(format!("no tags to copy for {}", src.name()));
    }
    None
}

/// Submits replication jobs for resource pairs
pub struct Scheduler {
    backend: Arc<dyn JobBackend>,
    public_url: String,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn JobBackend>, public_url: &str, concurrency: usize) -> Self {
        Self {
            backend,
            public_url: public_url.trim_end_matches('/').to_string(),
            concurrency: concurrency.max(1),
        }
    }

    /// Pair sources with destinations positionally. Pairs that cannot be
    /// replicated come back with `dst_resource.invalid` set.
    pub fn preprocess(
        &self,
        src_resources: Vec<Resource>,
        dst_resources: Vec<Resource>,
    ) -> Result<Vec<ScheduleItem>, SchedulerError> {
        if src_resources.len() != dst_resources.len() {
            return Err(SchedulerError::LengthMismatch {
                src: src_resources.len(),
                dst: dst_resources.len(),
            });
        }
        Ok(src_resources
            .into_iter()
            .zip(dst_resources)
            .map(|(src, mut dst)| {
                if let Some(reason) = validate_pair(&src, &dst) {
                    debug!(resource = %src.name(), reason = %reason, "Resource pair is invalid");
                    dst.invalid = Some(reason);
                }
                ScheduleItem {
                    task_id: 0,
                    src_resource: src,
                    dst_resource: dst,
                }
            })
            .collect())
    }

    pub fn status_hook(&self, task_id: i64) -> String {
        format!(
            "{}/service/notifications/jobs/replication/task/{}",
            self.public_url, task_id
        )
    }

    fn job_data(&self, item: &ScheduleItem) -> Result<JobData, JobServiceError> {
        let parameters = replication_parameters(&item.src_resource, &item.dst_resource)
            .map_err(|e| JobServiceError::Unavailable(format!("cannot encode resources: {}", e)))?;
        Ok(JobData {
            name: REPLICATION_JOB_NAME.to_string(),
            parameters,
            metadata: JobMetadata::default(),
            status_hook: self.status_hook(item.task_id),
        })
    }

    /// Submit one job per valid item, in parallel. Invalid items are skipped.
    pub async fn schedule(&self, items: &[ScheduleItem]) -> Vec<ScheduleResult> {
        let submissions: Vec<BoxFuture<'_, ScheduleResult>> = items
            .iter()
            .filter(|item| item.invalid_reason().is_none())
            .map(|item| self.submit_one(item).boxed())
            .collect();
        stream::iter(submissions)
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    async fn submit_one(&self, item: &ScheduleItem) -> ScheduleResult {
        let result = match self.job_data(item) {
            Ok(job) => self.backend.submit(&job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(
                task_id = item.task_id,
                resource = %item.src_resource.name(),
                "Job submission failed: {}",
                e
            );
        }
        ScheduleResult {
            task_id: item.task_id,
            result,
        }
    }

    /// Ask the backend to stop a job
    pub async fn stop(&self, job_id: &str) -> Result<(), JobServiceError> {
        self.backend.stop(job_id).await
    }

    pub async fn job_log(&self, job_id: &str) -> Result<String, JobServiceError> {
        self.backend.get_log(job_id).await
    }
}
