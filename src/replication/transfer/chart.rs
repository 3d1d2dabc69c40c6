use async_trait::async_trait;
use std::sync::Arc;

use super::{check_stop, tag_pairs, Transfer, TransferError};
use crate::replication::adapter::{Adapter, AdapterError, ChartRegistry};
use crate::replication::jobservice::JobContext;
use crate::replication::model::Resource;

/// Streams chart archives version by version
pub struct ChartTransfer {
    src: Arc<dyn Adapter>,
    dst: Arc<dyn Adapter>,
    ctx: JobContext,
}

fn charts(adapter: &dyn Adapter) -> Result<&dyn ChartRegistry, TransferError> {
    adapter.chart_registry().ok_or_else(|| {
        TransferError::Adapter(AdapterError::Unsupported("chart replication".to_string()))
    })
}

impl ChartTransfer {
    pub fn new(src: Arc<dyn Adapter>, dst: Arc<dyn Adapter>, ctx: JobContext) -> Self {
        Self { src, dst, ctx }
    }

    async fn delete(&self, dst: &Resource) -> Result<(), TransferError> {
        let registry = charts(self.dst.as_ref())?;
        let name = dst.name();
        for version in &dst.metadata.vtags {
            check_stop(&self.ctx)?;
            match registry.delete_chart(&name, version).await {
                Ok(()) => self.ctx.log.info(format!("Deleted chart {}:{}", name, version)),
                Err(e) if e.is_not_found() => self
                    .ctx
                    .log
                    .info(format!("Chart {}:{} does not exist, skipping", name, version)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transfer for ChartTransfer {
    async fn transfer(&self, src: &Resource, dst: &Resource) -> Result<(), TransferError> {
        if dst.deleted {
            return self.delete(dst).await;
        }

        let source = charts(self.src.as_ref())?;
        let destination = charts(self.dst.as_ref())?;
        let src_name = src.name();
        let dst_name = dst.name();
        for (src_version, dst_version) in tag_pairs(src, dst)? {
            check_stop(&self.ctx)?;
            if !dst.override_existing && destination.chart_exist(&dst_name, dst_version).await? {
                self.ctx.log.warn(format!(
                    "Chart {}:{} already exists and override is disabled, skipping",
                    dst_name, dst_version
                ));
                continue;
            }

            check_stop(&self.ctx)?;
            let archive = source.download_chart(&src_name, src_version).await?;
            destination
                .upload_chart(&dst_name, dst_version, archive)
                .await?;
            self.ctx.log.info(format!(
                "Copied chart {}:{} -> {}:{}",
                src_name, src_version, dst_name, dst_version
            ));
        }
        Ok(())
    }
}
