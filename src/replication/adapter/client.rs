use bytes::Bytes;
use futures::TryStreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::auth::{credential_authorizer, Authorizer, TokenAuthorizer};
use super::error::{check_response, AdapterError};
use super::manifest::Manifest;
use super::BlobStream;
use crate::replication::model::Registry;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const CATALOG_PAGE_SIZE: usize = 1000;

lazy_static! {
    static ref LINK_NEXT: Regex = Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).unwrap();
}

/// Transport settings shared by every registry client an adapter builds
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Whole-request timeout; `None` leaves large blob copies unbounded
    pub request_timeout: Option<Duration>,
    /// Tokens are treated as expired this long before they really are
    pub token_latency: Duration,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
            token_latency: Duration::from_secs(10),
            user_agent: format!("replicator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientOptions {
    pub fn http_client(&self, insecure: bool) -> Result<reqwest::Client, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .danger_accept_invalid_certs(insecure);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.build()?)
    }
}

/// Client for the registry-wide part of the distribution API
pub struct RegistryClient {
    base_url: Url,
    http: reqwest::Client,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl RegistryClient {
    /// Build a client for `registry`, using the bearer token flow with the
    /// registry's credential.
    pub fn new(registry: &Registry, options: &ClientOptions) -> Result<Self, AdapterError> {
        let base_url = Url::parse(registry.url.trim_end_matches('/'))?;
        let http = options.http_client(registry.insecure)?;
        let token_service_url = registry
            .core_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|core| format!("{}/service/token", core.trim_end_matches('/')));
        let authorizer = TokenAuthorizer::new(
            http.clone(),
            base_url.clone(),
            credential_authorizer(registry.credential.as_ref()),
            token_service_url,
            options.token_latency,
        );
        Ok(Self::with_authorizer(
            base_url,
            http,
            Some(Arc::new(authorizer)),
        ))
    }

    pub fn with_authorizer(
        base_url: Url,
        http: reqwest::Client,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        Self {
            base_url,
            http,
            authorizer,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, AdapterError> {
        Ok(self.base_url.join(path)?)
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url)
    }

    pub(crate) async fn send(&self, builder: RequestBuilder) -> Result<Response, AdapterError> {
        let mut request = builder.build()?;
        if let Some(authorizer) = &self.authorizer {
            authorizer.authorize(&mut request).await?;
        }
        debug!(method = %request.method(), url = %request.url(), "Registry request");
        Ok(self.http.execute(request).await?)
    }

    pub async fn ping(&self) -> Result<(), AdapterError> {
        let url = self.url("/v2/")?;
        let response = self.send(self.request(Method::GET, url)).await?;
        check_response(response).await?;
        Ok(())
    }

    /// Full repository catalog, following `Link` pagination
    pub async fn catalog(&self) -> Result<Vec<String>, AdapterError> {
        #[derive(Deserialize)]
        struct Catalog {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let mut url = self.url("/v2/_catalog")?;
        url.query_pairs_mut()
            .append_pair("n", &CATALOG_PAGE_SIZE.to_string());
        let mut repositories = Vec::new();
        loop {
            let response = check_response(self.send(self.request(Method::GET, url)).await?).await?;
            let next = next_link(&response);
            let page: Catalog = response.json().await?;
            repositories.extend(page.repositories);
            match next {
                Some(link) => url = self.base_url.join(&link)?,
                None => break,
            }
        }
        Ok(repositories)
    }

    pub fn repository(self: &Arc<Self>, name: &str) -> RepositoryClient {
        RepositoryClient {
            name: name.to_string(),
            client: self.clone(),
        }
    }
}

fn next_link(response: &Response) -> Option<String> {
    let header = response.headers().get(LINK)?.to_str().ok()?;
    LINK_NEXT.captures(header).map(|c| c[1].to_string())
}

/// Operations scoped to one repository
pub struct RepositoryClient {
    name: String,
    client: Arc<RegistryClient>,
}

impl RepositoryClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, suffix: &str) -> Result<Url, AdapterError> {
        self.client.url(&format!("/v2/{}/{}", self.name, suffix))
    }

    pub async fn list_tags(&self) -> Result<Vec<String>, AdapterError> {
        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let url = self.url("tags/list")?;
        let response =
            check_response(self.client.send(self.client.request(Method::GET, url)).await?).await?;
        let tags: Tags = response.json().await?;
        Ok(tags.tags.unwrap_or_default())
    }

    /// Digest of the manifest behind `reference`, or `None` if it does not exist
    pub async fn manifest_exist(
        &self,
        reference: &str,
        accepted_media_types: &[&str],
    ) -> Result<Option<String>, AdapterError> {
        let url = self.url(&format!("manifests/{}", reference))?;
        let builder = self
            .client
            .request(Method::HEAD, url)
            .header(ACCEPT, accepted_media_types.join(", "));
        let response = self.client.send(builder).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_response(response).await?;
        match header_str(&response, DOCKER_CONTENT_DIGEST) {
            Some(digest) if !digest.is_empty() => Ok(Some(digest)),
            _ => {
                // Some registries omit the digest on HEAD
                let manifest = self.pull_manifest(reference, accepted_media_types).await?;
                Ok(Some(manifest.digest))
            }
        }
    }

    pub async fn pull_manifest(
        &self,
        reference: &str,
        accepted_media_types: &[&str],
    ) -> Result<Manifest, AdapterError> {
        let url = self.url(&format!("manifests/{}", reference))?;
        let builder = self
            .client
            .request(Method::GET, url)
            .header(ACCEPT, accepted_media_types.join(", "));
        let response = check_response(self.client.send(builder).await?).await?;
        let content_type = header_str(&response, CONTENT_TYPE.as_str());
        let digest = header_str(&response, DOCKER_CONTENT_DIGEST);
        let payload = response.bytes().await?;
        Manifest::from_response(content_type.as_deref(), digest.as_deref(), payload)
    }

    pub async fn push_manifest(
        &self,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), AdapterError> {
        let url = self.url(&format!("manifests/{}", reference))?;
        let builder = self
            .client
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, media_type)
            .body(payload);
        check_response(self.client.send(builder).await?).await?;
        Ok(())
    }

    pub async fn delete_manifest(&self, reference: &str) -> Result<(), AdapterError> {
        let url = self.url(&format!("manifests/{}", reference))?;
        check_response(
            self.client
                .send(self.client.request(Method::DELETE, url))
                .await?,
        )
        .await?;
        Ok(())
    }

    pub async fn blob_exist(&self, digest: &str) -> Result<bool, AdapterError> {
        let url = self.url(&format!("blobs/{}", digest))?;
        let response = self
            .client
            .send(self.client.request(Method::HEAD, url))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_response(response).await.map(|_| true),
        }
    }

    pub async fn pull_blob(&self, digest: &str) -> Result<(u64, BlobStream), AdapterError> {
        let url = self.url(&format!("blobs/{}", digest))?;
        let response =
            check_response(self.client.send(self.client.request(Method::GET, url)).await?).await?;
        let size = response.content_length().unwrap_or(0);
        let stream: BlobStream = Box::pin(response.bytes_stream().map_err(AdapterError::from));
        Ok((size, stream))
    }

    /// Monolithic upload: open an upload session, then PUT the whole blob
    pub async fn push_blob(
        &self,
        digest: &str,
        size: u64,
        blob: BlobStream,
    ) -> Result<(), AdapterError> {
        let url = self.url("blobs/uploads/")?;
        let response = check_response(
            self.client
                .send(self.client.request(Method::POST, url.clone()))
                .await?,
        )
        .await?;
        let location = header_str(&response, LOCATION.as_str()).ok_or_else(|| {
            AdapterError::Decode("blob upload response carries no Location".to_string())
        })?;

        let mut upload_url = url.join(&location)?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        let mut builder = self
            .client
            .request(Method::PUT, upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(blob));
        if size > 0 {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        check_response(self.client.send(builder).await?).await?;
        Ok(())
    }
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::replication::adapter::manifest::{
        tests::schema2_payload, ACCEPTED_MEDIA_TYPES, MEDIA_TYPE_MANIFEST_V2,
    };
    use axum::body::Body;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, Method as HttpMethod};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{any, get};
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory distribution API serving one registry
    #[derive(Clone, Default)]
    pub(crate) struct FakeRegistry {
        pub(crate) manifests: Arc<Mutex<HashMap<(String, String), (String, Bytes)>>>,
        pub(crate) blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    }

    fn split_path(path: &str) -> Option<(String, &str, String)> {
        for kind in ["manifests", "blobs"] {
            let marker = format!("/{}/", kind);
            if let Some(idx) = path.rfind(&marker) {
                let repo = path[..idx].to_string();
                let rest = path[idx + marker.len()..].to_string();
                return Some((repo, kind, rest));
            }
        }
        None
    }

    async fn handle(
        State(state): State<FakeRegistry>,
        method: HttpMethod,
        Path(path): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        if path == "_catalog" {
            let mut repos: Vec<String> = state
                .manifests
                .lock()
                .unwrap()
                .keys()
                .map(|(r, _)| r.clone())
                .collect();
            repos.sort();
            repos.dedup();
            return axum::Json(serde_json::json!({ "repositories": repos })).into_response();
        }
        if let Some(repo) = path.strip_suffix("/tags/list") {
            let mut tags: Vec<String> = state
                .manifests
                .lock()
                .unwrap()
                .keys()
                .filter(|(r, t)| r == repo && !t.starts_with("sha256:"))
                .map(|(_, t)| t.clone())
                .collect();
            tags.sort();
            return axum::Json(serde_json::json!({ "name": repo, "tags": tags })).into_response();
        }

        let Some((repo, kind, rest)) = split_path(&path) else {
            return StatusCode::NOT_FOUND.into_response();
        };

        match (kind, method) {
            ("manifests", HttpMethod::HEAD) | ("manifests", HttpMethod::GET) => {
                let manifests = state.manifests.lock().unwrap();
                match manifests.get(&(repo, rest)) {
                    Some((media_type, payload)) => {
                        let digest = crate::replication::adapter::manifest::digest_of(payload);
                        (
                            [
                                (CONTENT_TYPE.as_str(), media_type.clone()),
                                (DOCKER_CONTENT_DIGEST, digest),
                            ],
                            payload.clone(),
                        )
                            .into_response()
                    }
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
            ("manifests", HttpMethod::PUT) => {
                let media_type = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let digest = crate::replication::adapter::manifest::digest_of(&body);
                let mut manifests = state.manifests.lock().unwrap();
                manifests.insert((repo.clone(), rest), (media_type.clone(), body.clone()));
                manifests.insert((repo, digest), (media_type, body));
                StatusCode::CREATED.into_response()
            }
            ("manifests", HttpMethod::DELETE) => {
                let mut manifests = state.manifests.lock().unwrap();
                let before = manifests.len();
                let digest = rest.clone();
                manifests.retain(|(r, t), (_, payload)| {
                    !(*r == repo
                        && (*t == digest
                            || crate::replication::adapter::manifest::digest_of(payload)
                                == digest))
                });
                if manifests.len() == before {
                    StatusCode::NOT_FOUND.into_response()
                } else {
                    StatusCode::ACCEPTED.into_response()
                }
            }
            ("blobs", HttpMethod::HEAD) | ("blobs", HttpMethod::GET) => {
                match state.blobs.lock().unwrap().get(&rest) {
                    Some(blob) => AxumResponse::builder()
                        .header(CONTENT_LENGTH, blob.len())
                        .body(Body::from(blob.clone()))
                        .unwrap(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
            ("blobs", HttpMethod::POST) if rest.starts_with("uploads") => (
                StatusCode::ACCEPTED,
                [(LOCATION.as_str(), format!("/v2/{}/blobs/uploads/session-1?_state=abc", repo))],
            )
                .into_response(),
            ("blobs", HttpMethod::PUT) => {
                assert_eq!(query.get("_state").map(String::as_str), Some("abc"));
                let digest = query.get("digest").cloned().unwrap_or_default();
                state.blobs.lock().unwrap().insert(digest, body);
                StatusCode::CREATED.into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    pub(crate) async fn start_fake_registry(state: FakeRegistry) -> String {
        let app = Router::new()
            .route("/v2/", get(|| async { StatusCode::OK }))
            .route("/v2/{*path}", any(handle))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: &str) -> Arc<RegistryClient> {
        let registry = Registry {
            id: 1,
            name: "fake".to_string(),
            registry_type: "native".to_string(),
            url: url.to_string(),
            core_url: None,
            credential: None,
            insecure: false,
            status: Default::default(),
        };
        Arc::new(RegistryClient::new(&registry, &ClientOptions::default()).unwrap())
    }

    #[tokio::test]
    async fn test_manifest_and_blob_round_trip() {
        let state = FakeRegistry::default();
        let url = start_fake_registry(state.clone()).await;
        let client = client(&url);
        client.ping().await.unwrap();
        let repo = client.repository("lib/app");

        assert!(!repo.blob_exist("sha256:layer").await.unwrap());
        let blob: BlobStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));
        repo.push_blob("sha256:layer", 11, blob).await.unwrap();
        assert!(repo.blob_exist("sha256:layer").await.unwrap());

        let (size, stream) = repo.pull_blob("sha256:layer").await.unwrap();
        assert_eq!(size, 11);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world".to_vec());

        assert_eq!(
            repo.manifest_exist("1.0", ACCEPTED_MEDIA_TYPES).await.unwrap(),
            None
        );
        let payload = schema2_payload("sha256:cfg", &["sha256:layer"]);
        repo.push_manifest("1.0", MEDIA_TYPE_MANIFEST_V2, payload.clone())
            .await
            .unwrap();

        let manifest = repo.pull_manifest("1.0", ACCEPTED_MEDIA_TYPES).await.unwrap();
        assert_eq!(manifest.media_type, MEDIA_TYPE_MANIFEST_V2);
        assert_eq!(manifest.payload, payload);
        assert_eq!(
            repo.manifest_exist("1.0", ACCEPTED_MEDIA_TYPES).await.unwrap(),
            Some(manifest.digest.clone())
        );

        assert_eq!(client.catalog().await.unwrap(), vec!["lib/app"]);
        assert_eq!(repo.list_tags().await.unwrap(), vec!["1.0"]);

        repo.delete_manifest(&manifest.digest).await.unwrap();
        assert_eq!(
            repo.manifest_exist("1.0", ACCEPTED_MEDIA_TYPES).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_pull_is_not_found() {
        let url = start_fake_registry(FakeRegistry::default()).await;
        let repo = client(&url).repository("lib/app");
        let err = repo
            .pull_manifest("nope", ACCEPTED_MEDIA_TYPES)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
