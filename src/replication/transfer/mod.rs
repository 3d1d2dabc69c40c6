pub mod chart;
pub mod repository;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::adapter::{Adapter, AdapterError};
use super::jobservice::JobContext;
use super::model::{Resource, ResourceType};

pub use chart::ChartTransfer;
pub use repository::ImageTransfer;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The job was asked to stop; never reported as a failure
    #[error("job stopped")]
    Stopped,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("invalid transfer input: {0}")]
    InvalidInput(String),

    #[error("job timed out after {0}s")]
    Timeout(u64),
}

impl TransferError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TransferError::Stopped)
    }

    /// Bad input fails the same way on every attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::Stopped | TransferError::InvalidInput(_))
    }
}

/// Copies or deletes one resource pair
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(&self, src: &Resource, dst: &Resource) -> Result<(), TransferError>;
}

/// Pick the transfer implementation for a resource type
pub fn transfer_for(
    resource_type: ResourceType,
    src: Arc<dyn Adapter>,
    dst: Arc<dyn Adapter>,
    ctx: JobContext,
) -> Box<dyn Transfer> {
    match resource_type {
        ResourceType::Repository => Box::new(ImageTransfer::new(src, dst, ctx)),
        ResourceType::Chart => Box::new(ChartTransfer::new(src, dst, ctx)),
    }
}

/// Checkpoint before a blocking network step
pub(crate) fn check_stop(ctx: &JobContext) -> Result<(), TransferError> {
    if ctx.stop.is_cancelled() {
        ctx.log.info("Stop requested, aborting transfer");
        return Err(TransferError::Stopped);
    }
    Ok(())
}

/// Source and destination tag lists must pair up one to one
pub(crate) fn tag_pairs<'a>(
    src: &'a Resource,
    dst: &'a Resource,
) -> Result<Vec<(&'a str, &'a str)>, TransferError> {
    let src_tags = &src.metadata.vtags;
    let dst_tags = &dst.metadata.vtags;
    if src_tags.len() != dst_tags.len() {
        return Err(TransferError::InvalidInput(format!(
            "{} source tags but {} destination tags",
            src_tags.len(),
            dst_tags.len()
        )));
    }
    if src_tags.is_empty() {
        return Err(TransferError::InvalidInput(format!(
            "no tags to copy for {}",
            src.name()
        )));
    }
    Ok(src_tags
        .iter()
        .map(String::as_str)
        .zip(dst_tags.iter().map(String::as_str))
        .collect())
}
