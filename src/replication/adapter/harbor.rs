use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::auth::{credential_authorizer, Authorizer};
use super::client::{ClientOptions, RegistryClient};
use super::error::check_response;
use super::image_registry::{DefaultImageRegistry, ImageLister};
use super::native::pattern_filters;
use super::{
    replace_namespace, Adapter, AdapterError, BlobStream, ChartRegistry, ImageRegistry,
};
use crate::replication::filter::name_allowed;
use crate::replication::model::{
    FilterStyle, HealthStatus, Namespace, NamespaceQuery, Registry, RegistryInfo, Resource,
    ResourceMetadata, ResourceType, REGISTRY_TYPE_HARBOR,
};
use crate::replication::policy::{Filter, TriggerType};

const PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
struct Project {
    project_id: i64,
    name: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Chart {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChartVersion {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct ChartVersionDetail {
    metadata: ChartVersion,
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    #[serde(default)]
    with_chartmuseum: bool,
}

/// Client for the Harbor core REST API
struct HarborApi {
    base_url: String,
    http: reqwest::Client,
    credential: Option<Arc<dyn Authorizer>>,
}

impl HarborApi {
    async fn send(&self, builder: RequestBuilder) -> Result<Response, AdapterError> {
        let mut request = builder.build()?;
        if let Some(credential) = &self.credential {
            credential.authorize(&mut request).await?;
        }
        debug!(method = %request.method(), url = %request.url(), "Harbor API request");
        Ok(self.http.execute(request).await?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let response =
            check_response(self.send(self.request(Method::GET, path).query(query)).await?).await?;
        Ok(response.json().await?)
    }

    async fn projects(&self, name: Option<&str>) -> Result<Vec<Project>, AdapterError> {
        let mut projects = Vec::new();
        let mut page = 1;
        loop {
            let mut query = vec![
                ("page", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ];
            if let Some(name) = name {
                query.push(("name", name.to_string()));
            }
            let batch: Option<Vec<Project>> = self.get_json("/api/projects", &query).await?;
            let batch = batch.unwrap_or_default();
            let done = batch.len() < PAGE_SIZE;
            projects.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(projects)
    }

    async fn project(&self, name: &str) -> Result<Option<Project>, AdapterError> {
        Ok(self
            .projects(Some(name))
            .await?
            .into_iter()
            .find(|p| p.name == name))
    }

    async fn repositories(&self, project_id: i64) -> Result<Vec<Repository>, AdapterError> {
        let mut repositories = Vec::new();
        let mut page = 1;
        loop {
            let query = [
                ("project_id", project_id.to_string()),
                ("page", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ];
            let batch: Option<Vec<Repository>> =
                self.get_json("/api/repositories", &query).await?;
            let batch = batch.unwrap_or_default();
            let done = batch.len() < PAGE_SIZE;
            repositories.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(repositories)
    }

    async fn tags(&self, repository: &str) -> Result<Vec<Tag>, AdapterError> {
        let tags: Option<Vec<Tag>> = self
            .get_json(&format!("/api/repositories/{}/tags", repository), &[])
            .await?;
        Ok(tags.unwrap_or_default())
    }

    /// Projects for `namespaces`, or every project when it is empty
    async fn projects_for(&self, namespaces: &[String]) -> Result<Vec<Project>, AdapterError> {
        if namespaces.is_empty() {
            return self.projects(None).await;
        }
        let mut projects = Vec::new();
        for ns in namespaces {
            match self.project(ns).await? {
                Some(p) => projects.push(p),
                None => warn!(project = %ns, "Project not found, skipping"),
            }
        }
        Ok(projects)
    }
}

fn label_names(labels: &[Label]) -> BTreeSet<String> {
    labels.iter().map(|l| l.name.clone()).collect()
}

fn split_project(name: &str) -> Result<(&str, &str), AdapterError> {
    name.split_once('/')
        .ok_or_else(|| AdapterError::InvalidResource(format!("'{}' has no project", name)))
}

struct HarborLister {
    api: Arc<HarborApi>,
}

#[async_trait]
impl ImageLister for HarborLister {
    async fn list_images(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        let mut resources = Vec::new();
        for project in self.api.projects_for(namespaces).await? {
            for repo in self.api.repositories(project.project_id).await? {
                if !name_allowed(filters, &repo.name) {
                    continue;
                }
                let tags = self.api.tags(&repo.name).await?;
                if tags.is_empty() {
                    continue;
                }
                let mut labels = BTreeSet::new();
                for tag in &tags {
                    labels.extend(label_names(&tag.labels));
                }
                let mut metadata = ResourceMetadata::from_repository_path(&repo.name);
                metadata.vtags = tags.into_iter().map(|t| t.name).collect();
                metadata.labels = labels.into_iter().collect();
                resources.push(Resource::new(ResourceType::Repository, metadata));
            }
        }
        Ok(resources)
    }
}

/// Adapter for another Harbor instance, or the local one
pub struct HarborAdapter {
    registry: Registry,
    api: Arc<HarborApi>,
    images: DefaultImageRegistry,
}

impl HarborAdapter {
    pub fn new(registry: &Registry, options: &ClientOptions) -> Result<Self, AdapterError> {
        let api = Arc::new(HarborApi {
            base_url: registry.api_url().to_string(),
            http: options.http_client(registry.insecure)?,
            credential: credential_authorizer(registry.credential.as_ref()),
        });
        let client = Arc::new(RegistryClient::new(registry, options)?);
        let lister = Arc::new(HarborLister { api: api.clone() });
        Ok(Self {
            registry: registry.clone(),
            api,
            images: DefaultImageRegistry::with_lister(client, lister),
        })
    }

    async fn chart_version(
        &self,
        project: &str,
        chart: &str,
        version: &str,
    ) -> Result<Option<ChartVersion>, AdapterError> {
        let path = format!(
            "/api/chartrepo/{}/charts/{}/{}",
            project,
            urlencoding::encode(chart),
            urlencoding::encode(version)
        );
        let response = self.api.send(self.api.request(Method::GET, &path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let detail: ChartVersionDetail = check_response(response).await?.json().await?;
        Ok(Some(detail.metadata))
    }
}

#[async_trait]
impl Adapter for HarborAdapter {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        let system: SystemInfo = self.api.get_json("/api/systeminfo", &[]).await?;
        let mut types = vec![ResourceType::Repository];
        if system.with_chartmuseum {
            types.push(ResourceType::Chart);
        }
        let mut filters = pattern_filters();
        filters.push(FilterStyle {
            filter_type: "label".to_string(),
            style: "list".to_string(),
            values: vec![],
        });
        filters.push(FilterStyle {
            filter_type: "resource".to_string(),
            style: "radio".to_string(),
            values: types.iter().map(|t| t.to_string()).collect(),
        });
        Ok(RegistryInfo {
            registry_type: REGISTRY_TYPE_HARBOR.to_string(),
            description: "Harbor registry".to_string(),
            supported_resource_types: types,
            supported_resource_filters: filters,
            supported_triggers: vec![
                TriggerType::Manual,
                TriggerType::Scheduled,
                TriggerType::EventBased,
            ],
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, AdapterError> {
        let result = self.api.send(self.api.request(Method::GET, "/api/ping")).await;
        match result {
            Ok(response) if response.status().is_success() => Ok(HealthStatus::Healthy),
            Ok(response) => {
                warn!(
                    registry = %self.registry.url,
                    status = %response.status(),
                    "Harbor health check failed"
                );
                Ok(HealthStatus::Unhealthy)
            }
            Err(e) => {
                warn!(registry = %self.registry.url, "Harbor health check failed: {}", e);
                Ok(HealthStatus::Unhealthy)
            }
        }
    }

    async fn list_namespaces(
        &self,
        query: &NamespaceQuery,
    ) -> Result<Vec<Namespace>, AdapterError> {
        Ok(self
            .api
            .projects(query.name.as_deref())
            .await?
            .into_iter()
            .map(|p| Namespace {
                name: p.name,
                metadata: p.metadata,
            })
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, AdapterError> {
        let project = self
            .api
            .project(name)
            .await?
            .ok_or_else(|| AdapterError::NotFound(format!("project {}", name)))?;
        Ok(Namespace {
            name: project.name,
            metadata: project.metadata,
        })
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), AdapterError> {
        let body = serde_json::json!({
            "project_name": namespace.name,
            "metadata": namespace.metadata,
        });
        let response = self
            .api
            .send(self.api.request(Method::POST, "/api/projects").json(&body))
            .await?;
        match check_response(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(project = %namespace.name, "Project already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn prepare_for_push(&self, resource: &Resource) -> Result<(), AdapterError> {
        if resource.metadata.namespace_name().is_none() {
            return Err(AdapterError::InvalidResource(format!(
                "Harbor requires a project for '{}'",
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

    fn chart_registry(&self) -> Option<&dyn ChartRegistry> {
        Some(self)
    }
}

#[async_trait]
impl ChartRegistry for HarborAdapter {
    async fn fetch_charts(
        &self,
        namespaces: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Resource>, AdapterError> {
        let mut resources = Vec::new();
        for project in self.api.projects_for(namespaces).await? {
            let charts: Option<Vec<Chart>> = self
                .api
                .get_json(&format!("/api/chartrepo/{}/charts", project.name), &[])
                .await?;
            for chart in charts.unwrap_or_default() {
                let full_name = format!("{}/{}", project.name, chart.name);
                if !name_allowed(filters, &full_name) {
                    continue;
                }
                let versions: Option<Vec<ChartVersion>> = self
                    .api
                    .get_json(
                        &format!(
                            "/api/chartrepo/{}/charts/{}",
                            project.name,
                            urlencoding::encode(&chart.name)
                        ),
                        &[],
                    )
                    .await?;
                let versions = versions.unwrap_or_default();
                if versions.is_empty() {
                    continue;
                }
                let mut labels = BTreeSet::new();
                for v in &versions {
                    labels.extend(label_names(&v.labels));
                }
                let metadata = ResourceMetadata {
                    namespace: Some(Namespace::new(&project.name)),
                    name: chart.name,
                    vtags: versions.into_iter().map(|v| v.version).collect(),
                    labels: labels.into_iter().collect(),
                };
                resources.push(Resource::new(ResourceType::Chart, metadata));
            }
        }
        Ok(resources)
    }

    async fn chart_exist(&self, name: &str, version: &str) -> Result<bool, AdapterError> {
        let (project, chart) = split_project(name)?;
        Ok(self.chart_version(project, chart, version).await?.is_some())
    }

    async fn download_chart(&self, name: &str, version: &str) -> Result<BlobStream, AdapterError> {
        let (project, chart) = split_project(name)?;
        let detail = self
            .chart_version(project, chart, version)
            .await?
            .ok_or_else(|| AdapterError::NotFound(format!("chart {}:{}", name, version)))?;
        let location = detail
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| format!("charts/{}-{}.tgz", chart, version));
        let url = if location.starts_with("http://") || location.starts_with("https://") {
            location
        } else {
            format!("{}/chartrepo/{}/{}", self.api.base_url, project, location)
        };

        let response = check_response(self.api.send(self.api.http.get(url)).await?).await?;
        let stream: BlobStream = Box::pin(response.bytes_stream().map_err(AdapterError::from));
        Ok(stream)
    }

    async fn upload_chart(
        &self,
        name: &str,
        version: &str,
        chart: BlobStream,
    ) -> Result<(), AdapterError> {
        let (project, chart_name) = split_project(name)?;
        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(chart))
            .file_name(format!("{}-{}.tgz", chart_name, version));
        let form = reqwest::multipart::Form::new().part("chart", part);
        let builder = self
            .api
            .request(Method::POST, &format!("/api/chartrepo/{}/charts", project))
            .multipart(form);
        check_response(self.api.send(builder).await?).await?;
        Ok(())
    }

    async fn delete_chart(&self, name: &str, version: &str) -> Result<(), AdapterError> {
        let (project, chart) = split_project(name)?;
        let path = format!(
            "/api/chartrepo/{}/charts/{}/{}",
            project,
            urlencoding::encode(chart),
            urlencoding::encode(version)
        );
        check_response(self.api.send(self.api.request(Method::DELETE, &path)).await?).await?;
        Ok(())
    }
}
