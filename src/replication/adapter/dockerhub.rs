use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::client::{ClientOptions, RegistryClient};
use super::error::check_response;
use super::image_registry::{DefaultImageRegistry, ImageLister};
use super::native::pattern_filters;
use super::{Adapter, AdapterError, ImageRegistry};
use crate::replication::filter::name_allowed;
use crate::replication::model::{
    Credential, HealthStatus, Namespace, NamespaceQuery, Registry, RegistryInfo, Resource,
    ResourceMetadata, ResourceType, REGISTRY_TYPE_DOCKER_HUB,
};
use crate::replication::policy::{Filter, TriggerType};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";
pub const DEFAULT_HUB_URL: &str = "https://hub.docker.com";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NamespacesResponse {
    #[serde(default)]
    namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HubRepository {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
}

/// Client for the Docker Hub web API, authenticated with a login JWT
struct HubClient {
    base_url: String,
    http: reqwest::Client,
    credential: Option<Credential>,
    token: Mutex<Option<String>>,
}

impl HubClient {
    async fn login(&self) -> Result<Option<String>, AdapterError> {
        let Some(credential) = &self.credential else {
            return Ok(None);
        };
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(Some(token.clone()));
        }
        let body = serde_json::json!({
            "username": credential.access_key,
            "password": credential.access_secret,
        });
        let response = self
            .http
            .post(format!("{}/v2/users/login/", self.base_url))
            .json(&body)
            .send()
            .await?;
        let login: LoginResponse = check_response(response).await?.json().await?;
        debug!("Logged in to Docker Hub as {}", credential.access_key);
        *token = Some(login.token.clone());
        Ok(Some(login.token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AdapterError> {
        let builder = match self.login().await? {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, format!("JWT {}", token)),
            None => builder,
        };
        Ok(builder.send().await?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, AdapterError> {
        let response = check_response(self.send(self.http.get(url)).await?).await?;
        Ok(response.json().await?)
    }

    /// Collect every page, following the absolute `next` links
    async fn paginate<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AdapterError> {
        let mut items = Vec::new();
        let mut url = Some(format!(
            "{}{}?page=1&page_size={}",
            self.base_url, path, PAGE_SIZE
        ));
        while let Some(current) = url {
            let page: Page<T> = self.get_json(current).await?;
            items.extend(page.results);
            url = page.next.filter(|n| !n.is_empty());
        }
        Ok(items)
    }

    async fn namespaces(&self) -> Result<Vec<String>, AdapterError> {
        let response: NamespacesResponse = self
            .get_json(format!("{}/v2/repositories/namespaces/", self.base_url))
            .await?;
        Ok(response.namespaces)
    }
}

struct HubLister {
    hub: Arc<HubClient>,
}

#[async_trait]
impl ImageLister for HubLister {
    async fn list_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        let namespaces = if namespaces.is_empty() {
            self.hub.namespaces().await?
        } else {
            namespaces.to_vec()
        };

        let mut resources = Vec::new();
        for ns in &namespaces {
            let repos: Vec<HubRepository> = self
                .hub
                .paginate(&format!("/v2/repositories/{}/", ns))
                .await?;
            for repo in repos {
                let namespace = repo.namespace.unwrap_or_else(|| ns.clone());
                let full_name = format!("{}/{}", namespace, repo.name);
                if !name_allowed(filters, &full_name) {
                    continue;
                }
                let tags: Vec<HubTag> = self
                    .hub
                    .paginate(&format!("/v2/repositories/{}/tags/", full_name))
                    .await?;
                if tags.is_empty() {
                    debug!(repository = %full_name, "Skipping repository without tags");
                    continue;
                }
                let metadata = ResourceMetadata {
                    namespace: Some(Namespace::new(namespace)),
                    name: repo.name,
                    vtags: tags.into_iter().map(|t| t.name).collect(),
                    labels: vec![],
                };
                resources.push(Resource::new(ResourceType::Repository, metadata));
            }
        }
        Ok(resources)
    }
}

/// Docker Hub: namespaces are user or organization names and repositories
/// cannot be nested below them.
pub struct DockerHubAdapter {
    registry: Registry,
    hub: Arc<HubClient>,
    images: DefaultImageRegistry,
}

impl DockerHubAdapter {
    pub fn new(registry: &Registry, options: &ClientOptions) -> Result<Self, AdapterError> {
        let mut endpoint = registry.clone();
        if endpoint.url.is_empty() || endpoint.url.trim_end_matches('/') == DEFAULT_HUB_URL {
            endpoint.url = DEFAULT_REGISTRY_URL.to_string();
        }
        // The token service is discovered from the registry challenge.
        endpoint.core_url = None;

        let hub_url = registry
            .core_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_HUB_URL)
            .trim_end_matches('/')
            .to_string();
        let hub = Arc::new(HubClient {
            base_url: hub_url,
            http: options.http_client(registry.insecure)?,
            credential: registry.credential.clone(),
            token: Mutex::new(None),
        });

        let client = Arc::new(RegistryClient::new(&endpoint, options)?);
        let lister = Arc::new(HubLister { hub: hub.clone() });
        Ok(Self {
            registry: registry.clone(),
            hub,
            images: DefaultImageRegistry::with_lister(client, lister),
        })
    }
}

#[async_trait]
impl Adapter for DockerHubAdapter {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        Ok(RegistryInfo {
            registry_type: REGISTRY_TYPE_DOCKER_HUB.to_string(),
            description: "Docker Hub".to_string(),
            supported_resource_types: vec![ResourceType::Repository],
            supported_resource_filters: pattern_filters(),
            supported_triggers: vec![TriggerType::Manual, TriggerType::Scheduled],
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, AdapterError> {
        let result = match self.hub.login().await {
            Ok(_) => self.images.client().ping().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(HealthStatus::Healthy),
            Err(e) => {
                warn!(registry = %self.registry.name, "Docker Hub health check failed: {}", e);
                Ok(HealthStatus::Unhealthy)
            }
        }
    }

    async fn list_namespaces(
        &self,
        query: &NamespaceQuery,
    ) -> Result<Vec<Namespace>, AdapterError> {
        Ok(self
            .hub
            .namespaces()
            .await?
            .into_iter()
            .filter(|ns| query.name.as_deref().map_or(true, |n| ns.contains(n)))
            .map(Namespace::new)
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, AdapterError> {
        let response = self
            .hub
            .send(self.hub.request(Method::GET, &format!("/v2/orgs/{}/", name)))
            .await?;
        check_response(response).await?;
        Ok(Namespace::new(name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), AdapterError> {
        if self.hub.namespaces().await?.contains(&namespace.name) {
            return Ok(());
        }
        let body = serde_json::json!({
            "orgname": namespace.name,
            "full_name": namespace.name,
            "company": namespace.name,
        });
        let response = self
            .hub
            .send(self.hub.request(Method::POST, "/v2/orgs/").json(&body))
            .await?;
        match check_response(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prepare_for_push(&self, resource: &Resource) -> Result<(), AdapterError> {
        if resource.metadata.namespace_name().is_none() {
            return Err(AdapterError::InvalidResource(format!(
                "Docker Hub requires a namespace for '{}'",
                resource.name()
            )));
        }
        Ok(())
    }

    fn convert_resource_metadata(
        &self,
        metadata: &ResourceMetadata,
        namespace: Option<&str>,
    ) -> Result<ResourceMetadata, AdapterError> {
        if metadata.name.contains('/') {
            return Err(AdapterError::InvalidResource(format!(
                "Docker Hub does not support nested repository '{}'",
                metadata.resource_name()
            )));
        }
        Ok(super::replace_namespace(metadata, namespace))
    }

    fn image_registry(&self) -> Option<&dyn ImageRegistry> {
        Some(&self.images)
    }
}
