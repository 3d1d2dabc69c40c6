//! In-process fakes shared by the replication tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::adapter::manifest::{digest_of, tests::schema2_payload, MEDIA_TYPE_MANIFEST_V2};
use super::adapter::{
    replace_namespace, Adapter, AdapterError, BlobStream, ChartRegistry, ImageRegistry, Manifest,
};
use super::model::{
    HealthStatus, Namespace, NamespaceQuery, RegistryInfo, Resource, ResourceMetadata,
    ResourceType,
};
use super::adapter::AdapterRegistry;
use super::execution::{
    ExecutionManager, InMemoryExecutionManager, Task, TaskQuery,
};
use super::flow::FlowContext;
use super::jobservice::{JobBackend, JobData, JobServiceError};
use super::model::Registry;
use super::policy::{self, Filter, Policy, TriggerType};
use super::scheduler::Scheduler;

#[derive(Default)]
pub(crate) struct FakeState {
    /// (repository, tag or digest) -> manifest
    pub manifests: HashMap<(String, String), Manifest>,
    pub blobs: HashMap<(String, String), Bytes>,
    /// (chart name, version) -> archive
    pub charts: HashMap<(String, String), Bytes>,
    pub namespaces: HashSet<String>,
    /// Resources returned by the listing calls
    pub resources: Vec<Resource>,
    /// Every mutating call, in order
    pub writes: Vec<String>,
}

/// Adapter backed by in-memory maps that records every write
#[derive(Default)]
pub(crate) struct FakeAdapter {
    pub state: Mutex<FakeState>,
    /// Repository names whose conversion fails
    pub reject_names: HashSet<String>,
}

impl FakeAdapter {
    pub fn with_resources(resources: Vec<Resource>) -> Self {
        let adapter = Self::default();
        adapter.state.lock().unwrap().resources = resources;
        adapter
    }

    /// Store a schema2 image with one layer and return its manifest digest
    pub fn seed_image(&self, repository: &str, tag: &str, layer: &str) -> String {
        let config = format!("sha256:config-{}", layer);
        let layer_digest = format!("sha256:layer-{}", layer);
        let payload = schema2_payload(&config, &[layer_digest.as_str()]);
        let digest = digest_of(&payload);
        let manifest = Manifest {
            media_type: MEDIA_TYPE_MANIFEST_V2.to_string(),
            digest: digest.clone(),
            payload,
        };
        let mut state = self.state.lock().unwrap();
        for d in [&config, &layer_digest] {
            state.blobs.insert(
                (repository.to_string(), d.clone()),
                Bytes::from(format!("blob {}", d)),
            );
        }
        state
            .manifests
            .insert((repository.to_string(), tag.to_string()), manifest.clone());
        state
            .manifests
            .insert((repository.to_string(), digest.clone()), manifest);
        digest
    }

    pub fn seed_chart(&self, name: &str, version: &str) {
        self.state.lock().unwrap().charts.insert(
            (name.to_string(), version.to_string()),
            Bytes::from(format!("{}-{}.tgz", name, version)),
        );
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn digest_of_tag(&self, repository: &str, tag: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .map(|m| m.digest.clone())
    }

    fn listed(&self, resource_type: ResourceType, namespaces: &[String]) -> Vec<Resource> {
        self.state
            .lock()
            .unwrap()
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .filter(|r| {
                namespaces.is_empty()
                    || r.metadata
                        .namespace_name()
                        .map_or(false, |ns| namespaces.iter().any(|n| n == ns))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        Ok(RegistryInfo {
            registry_type: "fake".to_string(),
            description: "in-memory registry".to_string(),
            supported_resource_types: vec![ResourceType::Repository],
            supported_resource_filters: vec![],
            supported_triggers: vec![TriggerType::Manual],
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, AdapterError> {
        Ok(HealthStatus::Healthy)
    }

    async fn list_namespaces(
        &self,
        _query: &NamespaceQuery,
    ) -> Result<Vec<Namespace>, AdapterError> {
        let state = self.state.lock().unwrap();
        Ok(state.namespaces.iter().map(Namespace::new).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, AdapterError> {
        let mut ns = Namespace::new(name);
        ns.metadata
            .insert("public".to_string(), serde_json::json!("true"));
        Ok(ns)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if !state.namespaces.insert(namespace.name.clone()) {
            return Err(AdapterError::Conflict(format!(
                "namespace {} already exists",
                namespace.name
            )));
        }
        state
            .writes
            .push(format!("create_namespace {}", namespace.name));
        Ok(())
    }

    fn convert_resource_metadata(
        &self,
        metadata: &ResourceMetadata,
        namespace: Option<&str>,
    ) -> Result<ResourceMetadata, AdapterError> {
        if self.reject_names.contains(&metadata.resource_name()) {
            return Err(AdapterError::InvalidResource(format!(
                "cannot convert {}",
                metadata.resource_name()
            )));
        }
        Ok(replace_namespace(metadata, namespace))
    }

    fn image_registry(&self) -> Option<&dyn ImageRegistry> {
        Some(self)
    }

    fn chart_registry(&self) -> Option<&dyn ChartRegistry> {
        Some(self)
    }
}

#[async_trait]
impl ImageRegistry for FakeAdapter {
    async fn fetch_images(
        &self,
        namespaces: &[String],
        _filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        Ok(self.listed(ResourceType::Repository, namespaces))
    }

    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<String>, AdapterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .map(|m| m.digest.clone()))
    }

    async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        _accepted_media_types: &[&str],
    ) -> Result<Manifest, AdapterError> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{}:{}", repository, reference)))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), AdapterError> {
        let manifest = Manifest {
            media_type: media_type.to_string(),
            digest: digest_of(&payload),
            payload,
        };
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push(format!("push_manifest {}:{}", repository, reference));
        state.manifests.insert(
            (repository.to_string(), manifest.digest.clone()),
            manifest.clone(),
        );
        state
            .manifests
            .insert((repository.to_string(), reference.to_string()), manifest);
        Ok(())
    }

    async fn delete_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push(format!("delete_manifest {}@{}", repository, reference));
        state
            .manifests
            .retain(|(repo, _), m| !(repo == repository && m.digest == reference));
        Ok(())
    }

    async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool, AdapterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string())))
    }

    async fn pull_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(u64, BlobStream), AdapterError> {
        let data = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(&(repository.to_string(), digest.to_string()))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(digest.to_string()))?;
        let size = data.len() as u64;
        let stream: BlobStream = Box::pin(futures::stream::iter(vec![Ok(data)]));
        Ok((size, stream))
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        _size: u64,
        blob: BlobStream,
    ) -> Result<(), AdapterError> {
        let chunks: Vec<Bytes> = blob.try_collect().await?;
        let data = Bytes::from(chunks.concat());
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push(format!("push_blob {}@{}", repository, digest));
        state
            .blobs
            .insert((repository.to_string(), digest.to_string()), data);
        Ok(())
    }
}

#[async_trait]
impl ChartRegistry for FakeAdapter {
    async fn fetch_charts(
        &self,
        namespaces: &[String],
        _filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        Ok(self.listed(ResourceType::Chart, namespaces))
    }

    async fn chart_exist(&self, name: &str, version: &str) -> Result<bool, AdapterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .charts
            .contains_key(&(name.to_string(), version.to_string())))
    }

    async fn download_chart(&self, name: &str, version: &str) -> Result<BlobStream, AdapterError> {
        let data = self
            .state
            .lock()
            .unwrap()
            .charts
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{}:{}", name, version)))?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(data)])))
    }

    async fn upload_chart(
        &self,
        name: &str,
        version: &str,
        chart: BlobStream,
    ) -> Result<(), AdapterError> {
        let chunks: Vec<Bytes> = chart.try_collect().await?;
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push(format!("upload_chart {}:{}", name, version));
        state.charts.insert(
            (name.to_string(), version.to_string()),
            Bytes::from(chunks.concat()),
        );
        Ok(())
    }

    async fn delete_chart(&self, name: &str, version: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push(format!("delete_chart {}:{}", name, version));
        state
            .charts
            .remove(&(name.to_string(), version.to_string()))
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(format!("{}:{}", name, version)))
    }
}

/// Job backend that records submissions instead of running them
#[derive(Default)]
pub(crate) struct FakeJobBackend {
    pub jobs: Mutex<Vec<JobData>>,
    pub stopped: Mutex<Vec<String>>,
    /// Resource names whose submission is rejected
    pub reject: HashSet<String>,
    pub reject_all: bool,
}

impl FakeJobBackend {
    pub fn failing_for(names: &[&str]) -> Self {
        Self {
            reject: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            reject_all: true,
            ..Default::default()
        }
    }

    pub fn submitted(&self) -> Vec<JobData> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobBackend for FakeJobBackend {
    async fn submit(&self, job: &JobData) -> Result<String, JobServiceError> {
        let src: Resource = job.parameters["src_resource"]
            .as_str()
            .and_then(|s| serde_json::from_str(s).ok())
            .ok_or_else(|| JobServiceError::Unavailable("bad parameters".to_string()))?;
        if self.reject_all || self.reject.contains(&src.name()) {
            return Err(JobServiceError::Rejected {
                status: 503,
                message: format!("cannot run {}", src.name()),
            });
        }
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(job.clone());
        Ok(format!("job-{}", jobs.len()))
    }

    async fn stop(&self, job_id: &str) -> Result<(), JobServiceError> {
        self.stopped.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn get_log(&self, job_id: &str) -> Result<String, JobServiceError> {
        Ok(format!("log of {}\n", job_id))
    }
}

pub(crate) const FAKE_REGISTRY_TYPE: &str = "fake";

pub(crate) fn fake_registry(name: &str) -> Registry {
    Registry {
        name: name.to_string(),
        registry_type: FAKE_REGISTRY_TYPE.to_string(),
        url: format!("https://{}.example.com", name),
        ..policy::tests::remote_registry()
    }
}

/// Flow services wired to a fake local and a fake remote registry
pub(crate) struct Harness {
    pub local: Arc<FakeAdapter>,
    pub remote: Arc<FakeAdapter>,
    pub backend: Arc<FakeJobBackend>,
    pub executions: Arc<InMemoryExecutionManager>,
    pub flow: FlowContext,
}

impl Harness {
    pub fn new(local: FakeAdapter, remote: FakeAdapter, backend: FakeJobBackend) -> Self {
        let local = Arc::new(local);
        let remote = Arc::new(remote);
        let backend = Arc::new(backend);
        let executions = Arc::new(InMemoryExecutionManager::new());

        let mut adapters = AdapterRegistry::new();
        let (l, r) = (local.clone(), remote.clone());
        adapters.register(
            FAKE_REGISTRY_TYPE,
            Arc::new(move |registry: &Registry| {
                let adapter: Arc<dyn Adapter> = if registry.name == "local" {
                    l.clone()
                } else {
                    r.clone()
                };
                Ok(adapter)
            }),
        );

        let flow = FlowContext {
            adapters: Arc::new(adapters),
            executions: executions.clone(),
            scheduler: Arc::new(Scheduler::new(backend.clone(), "http://core", 4)),
            local_registry: fake_registry("local"),
        };
        Self {
            local,
            remote,
            backend,
            executions,
            flow,
        }
    }

    /// Policy pushing from the local registry to the remote one
    pub fn push_policy(&self) -> Policy {
        Policy {
            dest_registry: Some(fake_registry("remote")),
            ..policy::tests::push_policy()
        }
    }

    pub async fn execution(&self, policy: &Policy) -> i64 {
        self.executions
            .create_execution(policy.id, policy.trigger_type())
            .await
            .unwrap()
            .id
    }

    pub async fn tasks(&self, execution_id: i64) -> Vec<Task> {
        self.executions
            .list_tasks(execution_id, &TaskQuery::default())
            .await
            .unwrap()
    }
}
