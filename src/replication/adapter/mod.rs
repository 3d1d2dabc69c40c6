pub mod auth;
pub mod client;
pub mod dockerhub;
pub mod error;
pub mod harbor;
pub mod huawei;
pub mod image_registry;
pub mod manifest;
pub mod native;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use client::ClientOptions;
pub use error::AdapterError;
pub use manifest::Manifest;
pub use registry::{AdapterFactory, AdapterRegistry};

use super::model::{
    HealthStatus, Namespace, NamespaceQuery, RegistryInfo, Resource, ResourceMetadata,
};
use super::policy::Filter;

/// Streamed blob or chart content
pub type BlobStream = BoxStream<'static, Result<Bytes, AdapterError>>;

/// Base contract every registry adapter implements.
///
/// Transfer capabilities are optional and reached through
/// [`Adapter::image_registry`] and [`Adapter::chart_registry`].
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Describe what the registry supports
    async fn info(&self) -> Result<RegistryInfo, AdapterError>;

    async fn health_check(&self) -> Result<HealthStatus, AdapterError>;

    async fn list_namespaces(
        &self,
        _query: &NamespaceQuery,
    ) -> Result<Vec<Namespace>, AdapterError> {
        Ok(Vec::new())
    }

    /// Look up a namespace with its metadata
    async fn get_namespace(&self, name: &str) -> Result<Namespace, AdapterError> {
        Ok(Namespace::new(name))
    }

    /// Create a namespace. An already existing namespace is not an error.
    async fn create_namespace(&self, _namespace: &Namespace) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Check that a destination resource can be pushed
    async fn prepare_for_push(&self, _resource: &Resource) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Translate source metadata into this registry's naming scheme.
    ///
    /// # Arguments
    /// * `metadata` - Metadata of the source resource
    /// * `namespace` - Destination namespace override, if the policy sets one
    fn convert_resource_metadata(
        &self,
        metadata: &ResourceMetadata,
        namespace: Option<&str>,
    ) -> Result<ResourceMetadata, AdapterError>;

    fn image_registry(&self) -> Option<&dyn ImageRegistry> {
        None
    }

    fn chart_registry(&self) -> Option<&dyn ChartRegistry> {
        None
    }
}

/// Image listing and the distribution-protocol transfer primitives
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// List repositories with their tags.
    ///
    /// # Arguments
    /// * `namespaces` - Restrict the listing to these namespaces; empty means all
    /// * `filters` - Policy filters the adapter may use to narrow the listing
    async fn fetch_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError>;

    /// Digest of the manifest for `reference`, `None` when it does not exist
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<String>, AdapterError>;

    async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        accepted_media_types: &[&str],
    ) -> Result<Manifest, AdapterError>;

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), AdapterError>;

    async fn delete_manifest(&self, repository: &str, reference: &str)
        -> Result<(), AdapterError>;

    async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool, AdapterError>;

    /// Returns the blob size (0 if unknown) and its content stream
    async fn pull_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(u64, BlobStream), AdapterError>;

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        blob: BlobStream,
    ) -> Result<(), AdapterError>;
}

/// Helm chart listing and transfer
#[async_trait]
pub trait ChartRegistry: Send + Sync {
    async fn fetch_charts(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError>;

    async fn chart_exist(&self, name: &str, version: &str) -> Result<bool, AdapterError>;

    async fn download_chart(&self, name: &str, version: &str) -> Result<BlobStream, AdapterError>;

    async fn upload_chart(
        &self,
        name: &str,
        version: &str,
        chart: BlobStream,
    ) -> Result<(), AdapterError>;

    async fn delete_chart(&self, name: &str, version: &str) -> Result<(), AdapterError>;
}

/// Conversion for registries without namespaces: the namespace becomes part
/// of the repository name.
pub fn fold_namespace(
    metadata: &ResourceMetadata,
    namespace: Option<&str>,
) -> ResourceMetadata {
    let mut source = metadata.clone();
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        source.namespace = Some(Namespace::new(ns));
    }
    ResourceMetadata {
        namespace: None,
        name: source.resource_name(),
        vtags: metadata.vtags.clone(),
        labels: metadata.labels.clone(),
    }
}

/// Conversion for namespaced registries: the override replaces the namespace
pub fn replace_namespace(
    metadata: &ResourceMetadata,
    namespace: Option<&str>,
) -> ResourceMetadata {
    let mut converted = metadata.clone();
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        converted.namespace = Some(Namespace::new(ns));
    }
    converted
}
