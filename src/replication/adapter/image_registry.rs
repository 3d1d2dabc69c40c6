use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::client::{RegistryClient, RepositoryClient};
use super::manifest::ACCEPTED_MEDIA_TYPES;
use super::{AdapterError, BlobStream, ImageRegistry, Manifest};
use crate::replication::filter::name_allowed;
use crate::replication::model::{Resource, ResourceMetadata, ResourceType};
use crate::replication::policy::Filter;

/// Source of the image listing used by [`DefaultImageRegistry::fetch_images`]
#[async_trait]
pub trait ImageLister: Send + Sync {
    async fn list_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError>;
}

/// Lists images through `/v2/_catalog` and `/v2/{name}/tags/list`
pub struct CatalogLister {
    client: Arc<RegistryClient>,
}

impl CatalogLister {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageLister for CatalogLister {
    async fn list_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        let mut resources = Vec::new();
        for name in self.client.catalog().await? {
            let metadata = ResourceMetadata::from_repository_path(&name);
            if !namespaces.is_empty() {
                let ns = metadata.namespace_name().unwrap_or("");
                if !namespaces.iter().any(|n| n == ns) {
                    continue;
                }
            }
            if !name_allowed(filters, &name) {
                continue;
            }

            let tags = self.client.repository(&name).list_tags().await?;
            if tags.is_empty() {
                debug!(repository = %name, "Skipping repository without tags");
                continue;
            }
            resources.push(Resource::new(
                ResourceType::Repository,
                ResourceMetadata {
                    vtags: tags,
                    ..metadata
                },
            ));
        }
        Ok(resources)
    }
}

/// Image registry capability over the standard distribution API.
///
/// Vendor adapters reuse it for the transfer primitives and plug in their
/// own [`ImageLister`].
pub struct DefaultImageRegistry {
    client: Arc<RegistryClient>,
    lister: Arc<dyn ImageLister>,
    repositories: RwLock<HashMap<String, Arc<RepositoryClient>>>,
}

impl DefaultImageRegistry {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        let lister = Arc::new(CatalogLister::new(client.clone()));
        Self::with_lister(client, lister)
    }

    pub fn with_lister(client: Arc<RegistryClient>, lister: Arc<dyn ImageLister>) -> Self {
        Self {
            client,
            lister,
            repositories: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    /// Memoized per-repository client
    fn repository(&self, name: &str) -> Arc<RepositoryClient> {
        {
            let repositories = self.repositories.read().unwrap_or_else(|e| e.into_inner());
            if let Some(repo) = repositories.get(name) {
                return repo.clone();
            }
        }
        let mut repositories = self.repositories.write().unwrap_or_else(|e| e.into_inner());
        repositories
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.client.repository(name)))
            .clone()
    }

    #[cfg(test)]
    fn cached_repositories(&self) -> usize {
        self.repositories.read().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ImageRegistry for DefaultImageRegistry {
    async fn fetch_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        self.lister.list_images(namespaces, filters).await
    }

    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<String>, AdapterError> {
        self.repository(repository)
            .manifest_exist(reference, ACCEPTED_MEDIA_TYPES)
            .await
    }

    async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        accepted_media_types: &[&str],
    ) -> Result<Manifest, AdapterError> {
        self.repository(repository)
            .pull_manifest(reference, accepted_media_types)
            .await
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), AdapterError> {
        self.repository(repository)
            .push_manifest(reference, media_type, payload)
            .await
    }

    async fn delete_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(), AdapterError> {
        self.repository(repository).delete_manifest(reference).await
    }

    async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool, AdapterError> {
        self.repository(repository).blob_exist(digest).await
    }

    async fn pull_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(u64, BlobStream), AdapterError> {
        self.repository(repository).pull_blob(digest).await
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        blob: BlobStream,
    ) -> Result<(), AdapterError> {
        self.repository(repository)
            .push_blob(digest, size, blob)
            .await
    }
}
