use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Request, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;
use url::Url;

use super::error::{check_response, AdapterError};
use crate::replication::model::{Credential, CredentialType};

lazy_static! {
    static ref CHALLENGE_PARAM: Regex = Regex::new(r#"(\w+)="([^"]*)""#).unwrap();
    static ref REPOSITORY_PATH: Regex =
        Regex::new(r"^/v2/(.+)/(manifests|blobs|tags)/").unwrap();
}

/// Modifies outgoing registry requests, usually by adding credentials
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &mut Request) -> Result<(), AdapterError>;
}

fn set_authorization(request: &mut Request, value: String) -> Result<(), AdapterError> {
    let value = HeaderValue::from_str(&value)
        .map_err(|e| AdapterError::InvalidResource(format!("invalid credential: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

pub struct BasicAuthorizer {
    username: String,
    password: String,
}

impl BasicAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    async fn authorize(&self, request: &mut Request) -> Result<(), AdapterError> {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        set_authorization(request, format!("Basic {}", encoded))
    }
}

/// Shared-secret header understood by Harbor core and its token service
pub struct SecretAuthorizer {
    secret: String,
}

impl SecretAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Authorizer for SecretAuthorizer {
    async fn authorize(&self, request: &mut Request) -> Result<(), AdapterError> {
        set_authorization(request, format!("Harbor-Secret {}", self.secret))
    }
}

/// Authorizer that presents the credential as-is
pub fn credential_authorizer(credential: Option<&Credential>) -> Option<Arc<dyn Authorizer>> {
    let credential = credential?;
    let authorizer: Arc<dyn Authorizer> = match credential.credential_type {
        CredentialType::Basic => Arc::new(BasicAuthorizer::new(
            &credential.access_key,
            &credential.access_secret,
        )),
        CredentialType::Secret => Arc::new(SecretAuthorizer::new(&credential.access_secret)),
    };
    Some(authorizer)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Challenge {
    None,
    Basic,
    Bearer { realm: String, service: String },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value
    pub(crate) fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                let mut realm = String::new();
                let mut service = String::new();
                for caps in CHALLENGE_PARAM.captures_iter(params) {
                    match caps[1].to_ascii_lowercase().as_str() {
                        "realm" => realm = caps[2].to_string(),
                        "service" => service = caps[2].to_string(),
                        _ => {}
                    }
                }
                Challenge::Bearer { realm, service }
            }
            "basic" => Challenge::Basic,
            _ => Challenge::None,
        }
    }
}

/// Token scope derived from a registry request
pub(crate) fn request_scope(method: &Method, path: &str) -> Option<String> {
    if path.starts_with("/v2/_catalog") {
        return Some("registry:catalog:*".to_string());
    }
    let caps = REPOSITORY_PATH.captures(path)?;
    let actions = match *method {
        Method::GET | Method::HEAD => "pull",
        Method::DELETE => "*",
        _ => "pull,push",
    };
    Some(format!("repository:{}:{}", &caps[1], actions))
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) token: String,
    pub(crate) issued_at: DateTime<Utc>,
    pub(crate) expires_in: i64,
}

impl Token {
    /// A token counts as expired `latency` before its real expiry
    pub(crate) fn is_expired(&self, now: DateTime<Utc>, latency: Duration) -> bool {
        let latency = ChronoDuration::from_std(latency).unwrap_or_else(|_| ChronoDuration::zero());
        now + latency >= self.issued_at + ChronoDuration::seconds(self.expires_in)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

const DEFAULT_TOKEN_EXPIRATION_SECS: i64 = 60;

/// Bearer token flow of the distribution protocol.
///
/// The first request pings `/v2/` to learn the auth challenge. Tokens are
/// fetched per scope from the realm (or a fixed token service URL) and cached
/// until shortly before they expire.
pub struct TokenAuthorizer {
    http: reqwest::Client,
    registry_url: Url,
    credential: Option<Arc<dyn Authorizer>>,
    token_service_url: Option<String>,
    latency: Duration,
    challenge: OnceCell<Challenge>,
    tokens: RwLock<HashMap<String, Token>>,
}

impl TokenAuthorizer {
    pub fn new(
        http: reqwest::Client,
        registry_url: Url,
        credential: Option<Arc<dyn Authorizer>>,
        token_service_url: Option<String>,
        latency: Duration,
    ) -> Self {
        Self {
            http,
            registry_url,
            credential,
            token_service_url,
            latency,
            challenge: OnceCell::new(),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    async fn ping(&self) -> Result<Challenge, AdapterError> {
        let url = self.registry_url.join("/v2/")?;
        let response = self.http.get(url).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(Challenge::None);
        }
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(Challenge::parse)
            .unwrap_or(Challenge::None);
        debug!(registry = %self.registry_url, ?challenge, "Discovered registry auth challenge");
        Ok(challenge)
    }

    fn owns(&self, url: &Url) -> bool {
        url.host_str() == self.registry_url.host_str()
            && url.port_or_known_default() == self.registry_url.port_or_known_default()
            && url.path().starts_with("/v2")
    }

    async fn cached_token(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens
            .get(scope)
            .filter(|t| !t.is_expired(Utc::now(), self.latency))
            .map(|t| t.token.clone())
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: &str,
        scope: Option<&str>,
    ) -> Result<Token, AdapterError> {
        let realm = self.token_service_url.as_deref().unwrap_or(realm);
        let mut url = Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if !service.is_empty() {
                query.append_pair("service", service);
            }
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.http.get(url).build()?;
        if let Some(credential) = &self.credential {
            credential.authorize(&mut request).await?;
        }
        let response = check_response(self.http.execute(request).await?).await?;
        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token)
            .ok_or_else(|| AdapterError::Decode("token service returned no token".to_string()))?;

        Ok(Token {
            token,
            issued_at: body.issued_at.unwrap_or_else(Utc::now),
            expires_in: body
                .expires_in
                .filter(|e| *e > 0)
                .unwrap_or(DEFAULT_TOKEN_EXPIRATION_SECS),
        })
    }

    async fn token_for(
        &self,
        realm: &str,
        service: &str,
        scope: Option<&str>,
    ) -> Result<String, AdapterError> {
        let key = scope.unwrap_or("").to_string();
        if let Some(token) = self.cached_token(&key).await {
            return Ok(token);
        }

        let token = self.fetch_token(realm, service, scope).await?;
        let value = token.token.clone();
        self.tokens.write().await.insert(key, token);
        Ok(value)
    }
}

#[async_trait]
impl Authorizer for TokenAuthorizer {
    async fn authorize(&self, request: &mut Request) -> Result<(), AdapterError> {
        if !self.owns(request.url()) {
            return Ok(());
        }

        let challenge = self.challenge.get_or_try_init(|| self.ping()).await?;
        match challenge {
            Challenge::None => Ok(()),
            Challenge::Basic => match &self.credential {
                Some(credential) => credential.authorize(request).await,
                None => Ok(()),
            },
            Challenge::Bearer { realm, service } => {
                let scope = request_scope(request.method(), request.url().path());
                let token = self.token_for(realm, service, scope.as_deref()).await?;
                set_authorization(request, format!("Bearer {}", token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        );
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: "registry.docker.io".to_string(),
            }
        );
        assert_eq!(Challenge::parse(r#"Basic realm="x""#), Challenge::Basic);
        assert_eq!(Challenge::parse(""), Challenge::None);
    }

    #[test]
    fn test_request_scope() {
        assert_eq!(
            request_scope(&Method::GET, "/v2/lib/app/manifests/latest").as_deref(),
            Some("repository:lib/app:pull")
        );
        assert_eq!(
            request_scope(&Method::PUT, "/v2/lib/team/app/manifests/1.0").as_deref(),
            Some("repository:lib/team/app:pull,push")
        );
        assert_eq!(
            request_scope(&Method::POST, "/v2/lib/app/blobs/uploads/").as_deref(),
            Some("repository:lib/app:pull,push")
        );
        assert_eq!(
            request_scope(&Method::DELETE, "/v2/lib/app/manifests/sha256:abc").as_deref(),
            Some("repository:lib/app:*")
        );
        assert_eq!(
            request_scope(&Method::GET, "/v2/_catalog").as_deref(),
            Some("registry:catalog:*")
        );
        assert_eq!(request_scope(&Method::GET, "/v2/"), None);
    }

    #[test]
    fn test_token_expiry_uses_latency_margin() {
        let issued_at = Utc::now();
        let token = Token {
            token: "t".to_string(),
            issued_at,
            expires_in: 60,
        };
        let latency = Duration::from_secs(10);
        assert!(!token.is_expired(issued_at, latency));
        assert!(!token.is_expired(issued_at + ChronoDuration::seconds(49), latency));
        assert!(token.is_expired(issued_at + ChronoDuration::seconds(50), latency));
    }

    #[derive(Clone)]
    struct FakeAuthServer {
        token_requests: Arc<AtomicUsize>,
        expires_in: i64,
        realm: Arc<std::sync::Mutex<String>>,
    }

    async fn v2_root(State(state): State<FakeAuthServer>) -> impl IntoResponse {
        let realm = state.realm.lock().unwrap().clone();
        (
            StatusCode::UNAUTHORIZED,
            [(
                WWW_AUTHENTICATE,
                format!(r#"Bearer realm="{}",service="fake-registry""#, realm),
            )],
        )
    }

    async fn token(State(state): State<FakeAuthServer>, headers: HeaderMap) -> impl IntoResponse {
        let n = state.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(headers.get(AUTHORIZATION).is_some(), "credential not sent");
        axum::Json(serde_json::json!({
            "token": format!("token-{}", n),
            "expires_in": state.expires_in,
        }))
    }

    async fn start_fake(expires_in: i64) -> (Url, FakeAuthServer) {
        let state = FakeAuthServer {
            token_requests: Arc::new(AtomicUsize::new(0)),
            expires_in,
            realm: Arc::new(std::sync::Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/v2/", get(v2_root))
            .route("/service/token", get(token))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        *state.realm.lock().unwrap() = format!("http://{}/service/token", addr);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{}", addr)).unwrap(), state)
    }

    fn authorizer(url: Url) -> TokenAuthorizer {
        TokenAuthorizer::new(
            reqwest::Client::new(),
            url,
            Some(Arc::new(BasicAuthorizer::new("admin", "secret"))),
            None,
            Duration::from_secs(10),
        )
    }

    async fn authorize_get(auth: &TokenAuthorizer, url: &Url, path: &str) -> String {
        let mut request = reqwest::Client::new()
            .get(url.join(path).unwrap())
            .build()
            .unwrap();
        auth.authorize(&mut request).await.unwrap();
        request
            .headers()
            .get(AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_token_cached_per_scope() {
        let (url, server) = start_fake(300).await;
        let auth = authorizer(url.clone());

        let first = authorize_get(&auth, &url, "/v2/lib/app/manifests/1.0").await;
        let second = authorize_get(&auth, &url, "/v2/lib/app/blobs/sha256:abc").await;
        assert_eq!(first, "Bearer token-1");
        assert_eq!(second, "Bearer token-1");
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 1);

        let other = authorize_get(&auth, &url, "/v2/lib/web/manifests/1.0").await;
        assert_eq!(other, "Bearer token-2");
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        // Shorter than the latency margin, so every cached token is stale
        let (url, server) = start_fake(5).await;
        let auth = authorizer(url.clone());

        authorize_get(&auth, &url, "/v2/lib/app/manifests/1.0").await;
        let second = authorize_get(&auth, &url, "/v2/lib/app/manifests/1.0").await;
        assert_eq!(second, "Bearer token-2");
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_foreign_host_not_authorized() {
        let (url, server) = start_fake(300).await;
        let auth = authorizer(url);

        let mut request = reqwest::Client::new()
            .get("http://blobs.example.com/v2/lib/app/blobs/sha256:abc")
            .build()
            .unwrap();
        auth.authorize(&mut request).await.unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 0);
    }
}
