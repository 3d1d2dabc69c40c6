pub mod copy;
pub mod deletion;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use copy::CopyFlow;
pub use deletion::DeletionFlow;

use super::adapter::{Adapter, AdapterRegistry};
use super::execution::{
    refresh_execution_status, ExecutionError, ExecutionManager, ExecutionStatus, NewTask,
    Operation, TaskStatus, TaskUpdate,
};
use super::filter::FilterChain;
use super::model::{Namespace, Registry, Resource, ResourceType};
use super::policy::{FilterType, Policy};
use super::scheduler::{ScheduleItem, Scheduler};

pub const NO_RESOURCES_TEXT: &str = "no resources need to be replicated";

/// Services a flow runs against
#[derive(Clone)]
pub struct FlowContext {
    pub adapters: Arc<AdapterRegistry>,
    pub executions: Arc<dyn ExecutionManager>,
    pub scheduler: Arc<Scheduler>,
    /// Registry standing in for a policy side left unset
    pub local_registry: Registry,
}

/// One orchestrated run of a policy. Returns the number of submitted jobs.
#[async_trait]
pub trait Flow: Send + Sync {
    async fn run(&self, ctx: &FlowContext) -> Result<usize>;
}

pub(crate) struct Endpoints {
    pub src_registry: Registry,
    pub src: Arc<dyn Adapter>,
    pub dst_registry: Registry,
    pub dst: Arc<dyn Adapter>,
}

/// Resolve both policy sides and build their adapters
pub(crate) fn initialize(ctx: &FlowContext, policy: &Policy) -> Result<Endpoints> {
    policy.validate().context("Invalid replication policy")?;
    let src_registry = policy
        .src_registry
        .clone()
        .unwrap_or_else(|| ctx.local_registry.clone());
    let dst_registry = policy
        .dest_registry
        .clone()
        .unwrap_or_else(|| ctx.local_registry.clone());
    let src = ctx
        .adapters
        .create(&src_registry)
        .with_context(|| format!("Failed to create adapter for source {}", src_registry.url))?;
    let dst = ctx.adapters.create(&dst_registry).with_context(|| {
        format!(
            "Failed to create adapter for destination {}",
            dst_registry.url
        )
    })?;
    Ok(Endpoints {
        src_registry,
        src,
        dst_registry,
        dst,
    })
}

/// List source resources of the policy's resource types
pub(crate) async fn fetch_resources(
    endpoints: &Endpoints,
    policy: &Policy,
    chain: &FilterChain,
) -> Result<Vec<Resource>> {
    let requested = chain.resource_types();
    let explicit = !requested.is_empty();
    let types = if explicit {
        requested
    } else {
        endpoints
            .src
            .info()
            .await
            .with_context(|| format!("Failed to get info of {}", endpoints.src_registry.url))?
            .supported_resource_types
    };
    let filters: Vec<_> = policy
        .filters
        .iter()
        .filter(|f| f.filter_type != FilterType::Resource)
        .cloned()
        .collect();

    let mut resources = Vec::new();
    for resource_type in types {
        let fetched = match resource_type {
            ResourceType::Repository => match endpoints.src.image_registry() {
                Some(images) => Some(
                    images
                        .fetch_images(&policy.src_namespaces, &filters)
                        .await
                        .context("Failed to fetch images")?,
                ),
                None => None,
            },
            ResourceType::Chart => match endpoints.src.chart_registry() {
                Some(charts) => Some(
                    charts
                        .fetch_charts(&policy.src_namespaces, &filters)
                        .await
                        .context("Failed to fetch charts")?,
                ),
                None => None,
            },
        };
        match fetched {
            Some(found) => {
                debug!(resource_type = %resource_type, count = found.len(), "Fetched resources");
                resources.extend(found);
            }
            None if explicit => bail!(
                "Registry {} does not support {} resources",
                endpoints.src_registry.url,
                resource_type
            ),
            None => {}
        }
    }
    Ok(resources)
}

/// Apply the policy filters and attach the source registry
pub(crate) fn filter_resources(
    resources: Vec<Resource>,
    chain: &FilterChain,
    src_registry: &Registry,
) -> Vec<Resource> {
    chain
        .apply(resources)
        .into_iter()
        .map(|mut r| {
            r.registry = Some(src_registry.clone());
            r
        })
        .collect()
}

/// Distinct destination namespaces, with metadata taken from the source
pub(crate) async fn assemble_dst_namespaces(
    src: &dyn Adapter,
    resources: &[Resource],
    dest_namespace: &str,
) -> Result<Vec<Namespace>> {
    if !dest_namespace.is_empty() {
        return Ok(vec![Namespace::new(dest_namespace)]);
    }
    let mut names: Vec<&str> = Vec::new();
    for ns in resources.iter().filter_map(|r| r.metadata.namespace_name()) {
        if !names.contains(&ns) {
            names.push(ns);
        }
    }
    let mut namespaces = Vec::with_capacity(names.len());
    for name in names {
        let ns = src
            .get_namespace(name)
            .await
            .with_context(|| format!("Failed to get namespace {} from the source", name))?;
        namespaces.push(ns);
    }
    Ok(namespaces)
}

pub(crate) async fn create_namespaces(dst: &dyn Adapter, namespaces: &[Namespace]) -> Result<()> {
    for ns in namespaces {
        match dst.create_namespace(ns).await {
            Ok(()) => debug!(namespace = %ns.name, "Namespace created"),
            Err(e) if e.is_conflict() => debug!(namespace = %ns.name, "Namespace already exists"),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create namespace {}", ns.name))
            }
        }
    }
    Ok(())
}

/// Destination resource for each source. Conversion failures mark the
/// destination invalid instead of failing the batch.
pub(crate) async fn assemble_dst_resources(
    dst: &dyn Adapter,
    dst_registry: &Registry,
    src_resources: &[Resource],
    policy: &Policy,
) -> Vec<Resource> {
    let dest_namespace = Some(policy.dest_namespace.as_str()).filter(|ns| !ns.is_empty());
    let mut dst_resources = Vec::with_capacity(src_resources.len());
    for src in src_resources {
        let mut resource = Resource::new(src.resource_type, src.metadata.clone());
        resource.registry = Some(dst_registry.clone());
        resource.extended_info = src.extended_info.clone();
        resource.deleted = src.deleted;
        resource.override_existing = policy.override_existing;

        match dst.convert_resource_metadata(&src.metadata, dest_namespace) {
            Ok(metadata) => {
                resource.metadata = metadata;
                if let Err(e) = dst.prepare_for_push(&resource).await {
                    warn!(resource = %src.name(), "Cannot push resource: {}", e);
                    resource.invalid = Some(e.to_string());
                }
            }
            Err(e) => {
                warn!(resource = %src.name(), "Failed to convert resource metadata: {}", e);
                resource.invalid = Some(e.to_string());
            }
        }
        dst_resources.push(resource);
    }
    dst_resources
}

/// Persist one task per item, recording the task ids on the items
pub(crate) async fn create_tasks(
    ctx: &FlowContext,
    execution_id: i64,
    items: &mut [ScheduleItem],
) -> Result<()> {
    for item in items.iter_mut() {
        let operation = if item.dst_resource.deleted {
            Operation::Deletion
        } else {
            Operation::Copy
        };
        let (status, status_text, end_time) = match item.invalid_reason() {
            Some(reason) => (TaskStatus::Failed, reason.to_string(), Some(Utc::now())),
            None => (TaskStatus::Initialized, String::new(), None),
        };
        let task = ctx
            .executions
            .create_task(NewTask {
                execution_id,
                resource_type: item.src_resource.resource_type,
                src_resource: item.src_resource.display_name(),
                dst_resource: item.dst_resource.display_name(),
                operation,
                status,
                status_text,
                end_time,
            })
            .await
            .with_context(|| {
                format!(
                    "Failed to create task for {}",
                    item.src_resource.display_name()
                )
            })?;
        item.task_id = task.id;
    }
    Ok(())
}

/// Submit the valid items and record the outcome on their tasks. Returns
/// the ids of the submitted jobs.
pub(crate) async fn schedule(
    ctx: &FlowContext,
    execution_id: i64,
    items: &[ScheduleItem],
) -> Result<Vec<String>> {
    let results = ctx.scheduler.schedule(items).await;
    let mut job_ids = Vec::new();
    let mut errors = Vec::new();
    for result in &results {
        match &result.result {
            Ok(job_id) => {
                ctx.executions
                    .mark_task_submitted(result.task_id, job_id, Utc::now())
                    .await?;
                job_ids.push(job_id.clone());
            }
            Err(e) => {
                let update = TaskUpdate {
                    status: TaskStatus::Failed,
                    status_text: Some(e.to_string()),
                    revision: None,
                    start_time: None,
                    end_time: Some(Utc::now()),
                };
                ctx.executions.update_task(result.task_id, &update).await?;
                errors.push(e.to_string());
            }
        }
    }
    info!(
        execution_id,
        submitted = job_ids.len(),
        failed = errors.len(),
        "Replication jobs submitted"
    );
    if !results.is_empty() && job_ids.is_empty() {
        bail!("all tasks are failed: {}", errors.join("; "));
    }
    Ok(job_ids)
}

async fn is_stopped(ctx: &FlowContext, execution_id: i64) -> Result<bool> {
    let execution = ctx
        .executions
        .get_execution(execution_id)
        .await?
        .ok_or(ExecutionError::ExecutionNotFound(execution_id))?;
    Ok(execution.status == ExecutionStatus::Stopped)
}

/// Mark the tasks of a stopped execution that were never submitted
async fn stop_tasks(ctx: &FlowContext, items: &[ScheduleItem]) -> Result<()> {
    let update = TaskUpdate {
        status: TaskStatus::Stopped,
        status_text: None,
        revision: None,
        start_time: None,
        end_time: Some(Utc::now()),
    };
    for item in items {
        ctx.executions.update_task(item.task_id, &update).await?;
    }
    Ok(())
}

/// End the execution early because nothing matched
pub(crate) async fn finish_empty(ctx: &FlowContext, execution_id: i64) -> Result<usize> {
    info!(execution_id, "{}", NO_RESOURCES_TEXT);
    ctx.executions
        .finish_execution(execution_id, ExecutionStatus::Succeed, NO_RESOURCES_TEXT)
        .await?;
    Ok(0)
}

/// Shared tail of both flows: pair, persist, submit, converge.
///
/// The execution may be stopped while the flow runs. Nothing is persisted
/// or submitted once it is, and jobs that raced the stop are stopped here.
pub(crate) async fn schedule_resources(
    ctx: &FlowContext,
    execution_id: i64,
    src_resources: Vec<Resource>,
    dst_resources: Vec<Resource>,
) -> Result<usize> {
    let mut items = ctx
        .scheduler
        .preprocess(src_resources, dst_resources)
        .context("Failed to preprocess resources")?;
    if is_stopped(ctx, execution_id).await? {
        info!(execution_id, "Execution stopped before tasks were created");
        return Ok(0);
    }
    create_tasks(ctx, execution_id, &mut items).await?;
    if is_stopped(ctx, execution_id).await? {
        info!(execution_id, "Execution stopped before jobs were submitted");
        stop_tasks(ctx, &items).await?;
        return Ok(0);
    }

    let job_ids = schedule(ctx, execution_id, &items).await?;
    if is_stopped(ctx, execution_id).await? {
        for job_id in &job_ids {
            if let Err(e) = ctx.scheduler.stop(job_id).await {
                warn!(execution_id, job_id = %job_id, "Failed to stop job: {}", e);
            }
        }
        return Ok(job_ids.len());
    }
    refresh_execution_status(ctx.executions.as_ref(), execution_id).await?;
    Ok(job_ids.len())
}
