use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::auth::{credential_authorizer, Authorizer};
use super::client::{ClientOptions, RegistryClient};
use super::error::check_response;
use super::image_registry::{DefaultImageRegistry, ImageLister};
use super::native::pattern_filters;
use super::{replace_namespace, Adapter, AdapterError, ImageRegistry};
use crate::replication::filter::name_allowed;
use crate::replication::model::{
    HealthStatus, Namespace, NamespaceQuery, Registry, RegistryInfo, Resource, ResourceMetadata,
    ResourceType, REGISTRY_TYPE_HUAWEI,
};
use crate::replication::policy::{Filter, TriggerType};

#[derive(Debug, Deserialize)]
struct DockyardNamespace {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DockyardNamespaces {
    #[serde(default)]
    namespaces: Vec<DockyardNamespace>,
}

#[derive(Debug, Deserialize)]
struct DockyardRepository {
    name: String,
    namespace: String,
    #[serde(default)]
    tags: Vec<String>,
}

struct Dockyard {
    base_url: String,
    http: reqwest::Client,
    credential: Option<Arc<dyn Authorizer>>,
}

impl Dockyard {
    async fn send(&self, method: Method, path: &str) -> Result<Response, AdapterError> {
        self.send_builder(
            self.http
                .request(method, format!("{}/dockyard/v2{}", self.base_url, path)),
        )
        .await
    }

    async fn send_builder(&self, builder: RequestBuilder) -> Result<Response, AdapterError> {
        let mut request = builder.build()?;
        if let Some(credential) = &self.credential {
            credential.authorize(&mut request).await?;
        }
        Ok(self.http.execute(request).await?)
    }

    async fn namespaces(&self) -> Result<Vec<String>, AdapterError> {
        let response = check_response(self.send(Method::GET, "/namespaces").await?).await?;
        let body: DockyardNamespaces = response.json().await?;
        Ok(body.namespaces.into_iter().map(|ns| ns.name).collect())
    }

    async fn repositories(&self) -> Result<Vec<DockyardRepository>, AdapterError> {
        let response = check_response(
            self.send(Method::GET, "/repositories?filter=center::self")
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }
}

struct DockyardLister {
    dockyard: Arc<Dockyard>,
}

#[async_trait]
impl ImageLister for DockyardLister {
    async fn list_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        let mut resources = Vec::new();
        for repo in self.dockyard.repositories().await? {
            if !namespaces.is_empty() && !namespaces.contains(&repo.namespace) {
                continue;
            }
            let full_name = format!("{}/{}", repo.namespace, repo.name);
            if repo.tags.is_empty() || !name_allowed(filters, &full_name) {
                continue;
            }
            resources.push(Resource::new(
                ResourceType::Repository,
                ResourceMetadata {
                    namespace: Some(Namespace::new(repo.namespace)),
                    name: repo.name,
                    vtags: repo.tags,
                    labels: vec![],
                },
            ));
        }
        Ok(resources)
    }
}

/// Huawei SWR, with namespaces and listings served by the dockyard API
pub struct HuaweiAdapter {
    registry: Registry,
    dockyard: Arc<Dockyard>,
    images: DefaultImageRegistry,
}

impl HuaweiAdapter {
    pub fn new(registry: &Registry, options: &ClientOptions) -> Result<Self, AdapterError> {
        let dockyard = Arc::new(Dockyard {
            base_url: registry.api_url().to_string(),
            http: options.http_client(registry.insecure)?,
            credential: credential_authorizer(registry.credential.as_ref()),
        });
        let client = Arc::new(RegistryClient::new(registry, options)?);
        let lister = Arc::new(DockyardLister {
            dockyard: dockyard.clone(),
        });
        Ok(Self {
            registry: registry.clone(),
            dockyard,
            images: DefaultImageRegistry::with_lister(client, lister),
        })
    }
}

#[async_trait]
impl Adapter for HuaweiAdapter {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        Ok(RegistryInfo {
            registry_type: REGISTRY_TYPE_HUAWEI.to_string(),
            description: "Huawei Software Repository for Container".to_string(),
            supported_resource_types: vec![ResourceType::Repository],
            supported_resource_filters: pattern_filters(),
            supported_triggers: vec![TriggerType::Manual, TriggerType::Scheduled],
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, AdapterError> {
        match self.dockyard.namespaces().await {
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(e) => {
                warn!(registry = %self.registry.url, "SWR health check failed: {}", e);
                Ok(HealthStatus::Unhealthy)
            }
        }
    }

    async fn list_namespaces(
        &self,
        query: &NamespaceQuery,
    ) -> Result<Vec<Namespace>, AdapterError> {
        Ok(self
            .dockyard
            .namespaces()
            .await?
            .into_iter()
            .filter(|ns| query.name.as_deref().map_or(true, |n| ns.contains(n)))
            .map(Namespace::new)
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, AdapterError> {
        check_response(
            self.dockyard
                .send(Method::GET, &format!("/namespaces/{}", name))
                .await?,
        )
        .await?;
        Ok(Namespace::new(name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), AdapterError> {
        let builder = self
            .dockyard
            .http
            .post(format!("{}/dockyard/v2/namespaces", self.dockyard.base_url))
            .json(&serde_json::json!({ "namespace": namespace.name }));
        match check_response(self.dockyard.send_builder(builder).await?).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prepare_for_push(&self, resource: &Resource) -> Result<(), AdapterError> {
        if resource.metadata.namespace_name().is_none() {
            return Err(AdapterError::InvalidResource(format!(
                "SWR requires a namespace for '{}'",
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
        Ok(replace_namespace(metadata, namespace))
    }

    fn image_registry(&self) -> Option<&dyn ImageRegistry> {
        Some(&self.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::model::{Credential, CredentialType};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn start_fake() -> String {
        let app = Router::new()
            .route(
                "/dockyard/v2/namespaces",
                get(|| async { Json(json!({"namespaces": [{"name": "team"}]})) }).post(
                    |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                        assert!(headers.get("authorization").is_some());
                        if body["namespace"] == json!("team") {
                            StatusCode::CONFLICT
                        } else {
                            StatusCode::CREATED
                        }
                    },
                ),
            )
            .route(
                "/dockyard/v2/repositories",
                get(|| async {
                    Json(json!([
                        {"name": "api", "namespace": "team", "tags": ["v1", "v2"]},
                        {"name": "old", "namespace": "team", "tags": []},
                        {"name": "db", "namespace": "other", "tags": ["1"]}
                    ]))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn adapter(url: &str) -> HuaweiAdapter {
        let registry = Registry {
            id: 5,
            name: "swr".to_string(),
            registry_type: REGISTRY_TYPE_HUAWEI.to_string(),
            url: url.to_string(),
            core_url: None,
            credential: Some(Credential {
                credential_type: CredentialType::Basic,
                access_key: "cn-north-1@ak".to_string(),
                access_secret: "sk".to_string(),
            }),
            insecure: false,
            status: HealthStatus::Unknown,
        };
        HuaweiAdapter::new(&registry, &ClientOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_images_by_namespace() {
        let url = start_fake().await;
        let adapter = adapter(&url);
        let images = adapter.image_registry().unwrap();

        let resources = images
            .fetch_images(&["team".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name(), "team/api");
        assert_eq!(resources[0].metadata.vtags, vec!["v1", "v2"]);

        assert_eq!(images.fetch_images(&[], &[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_namespaces() {
        let url = start_fake().await;
        let adapter = adapter(&url);
        adapter.create_namespace(&Namespace::new("team")).await.unwrap();
        adapter.create_namespace(&Namespace::new("new")).await.unwrap();
        assert_eq!(adapter.health_check().await.unwrap(), HealthStatus::Healthy);
        let names: Vec<String> = adapter
            .list_namespaces(&NamespaceQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|ns| ns.name)
            .collect();
        assert_eq!(names, vec!["team"]);
    }
}
