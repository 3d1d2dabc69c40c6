use async_trait::async_trait;
use std::sync::Arc;

use super::{check_stop, tag_pairs, Transfer, TransferError};
use crate::replication::adapter::manifest::ACCEPTED_MEDIA_TYPES;
use crate::replication::adapter::{Adapter, AdapterError, ImageRegistry};
use crate::replication::jobservice::JobContext;
use crate::replication::model::Resource;

/// Copies image tags blob by blob, or deletes them, between two registries
pub struct ImageTransfer {
    src: Arc<dyn Adapter>,
    dst: Arc<dyn Adapter>,
    ctx: JobContext,
}

fn images(adapter: &dyn Adapter) -> Result<&dyn ImageRegistry, TransferError> {
    adapter.image_registry().ok_or_else(|| {
        TransferError::Adapter(AdapterError::Unsupported("image replication".to_string()))
    })
}

impl ImageTransfer {
    pub fn new(src: Arc<dyn Adapter>, dst: Arc<dyn Adapter>, ctx: JobContext) -> Self {
        Self { src, dst, ctx }
    }

    async fn copy_tag(
        &self,
        src_repo: &str,
        src_tag: &str,
        dst_repo: &str,
        dst_tag: &str,
        override_existing: bool,
    ) -> Result<(), TransferError> {
        let src = images(self.src.as_ref())?;
        let dst = images(self.dst.as_ref())?;
        let log = &self.ctx.log;

        check_stop(&self.ctx)?;
        let manifest = src
            .pull_manifest(src_repo, src_tag, ACCEPTED_MEDIA_TYPES)
            .await?;
        log.info(format!(
            "Pulled manifest {}:{} ({}, {})",
            src_repo, src_tag, manifest.media_type, manifest.digest
        ));

        match dst.manifest_exist(dst_repo, dst_tag).await? {
            Some(digest) if digest == manifest.digest => {
                log.info(format!(
                    "{}:{} already exists with digest {}, skipping",
                    dst_repo, dst_tag, digest
                ));
                return Ok(());
            }
            Some(digest) if !override_existing => {
                log.warn(format!(
                    "{}:{} exists with different digest {} and override is disabled, skipping",
                    dst_repo, dst_tag, digest
                ));
                return Ok(());
            }
            _ => {}
        }

        for descriptor in manifest.references()? {
            check_stop(&self.ctx)?;
            if dst.blob_exist(dst_repo, &descriptor.digest).await? {
                log.info(format!("Blob {} exists, skipping", descriptor.digest));
                continue;
            }
            let (size, blob) = src.pull_blob(src_repo, &descriptor.digest).await?;
            let size = if size == 0 { descriptor.size } else { size };
            dst.push_blob(dst_repo, &descriptor.digest, size, blob)
                .await?;
            log.info(format!("Copied blob {} ({} bytes)", descriptor.digest, size));
        }

        check_stop(&self.ctx)?;
        dst.push_manifest(dst_repo, dst_tag, &manifest.media_type, manifest.payload.clone())
            .await?;
        log.info(format!(
            "Pushed manifest {}:{} -> {}:{}",
            src_repo, src_tag, dst_repo, dst_tag
        ));
        Ok(())
    }

    async fn delete(&self, dst: &Resource) -> Result<(), TransferError> {
        let registry = images(self.dst.as_ref())?;
        let repository = dst.name();
        for tag in &dst.metadata.vtags {
            check_stop(&self.ctx)?;
            match registry.manifest_exist(&repository, tag).await? {
                None => {
                    self.ctx
                        .log
                        .info(format!("{}:{} does not exist, skipping", repository, tag));
                }
                Some(digest) => {
                    registry.delete_manifest(&repository, &digest).await?;
                    self.ctx
                        .log
                        .info(format!("Deleted {}:{} ({})", repository, tag, digest));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transfer for ImageTransfer {
    async fn transfer(&self, src: &Resource, dst: &Resource) -> Result<(), TransferError> {
        if dst.deleted {
            return self.delete(dst).await;
        }

        let src_repo = src.name();
        let dst_repo = dst.name();
        for (src_tag, dst_tag) in tag_pairs(src, dst)? {
            self.copy_tag(&src_repo, src_tag, &dst_repo, dst_tag, dst.override_existing)
                .await?;
        }
        Ok(())
    }
}
