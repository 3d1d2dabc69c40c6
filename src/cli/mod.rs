#[cfg(feature = "backend")]
pub mod backend;
pub mod execution;
pub mod policy;

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Thin client for the replication API of a running backend
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/replication{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Failed to reach backend at {}", self.base_url))?;
        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse backend response")
    }

    pub async fn get_text(&self, path: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Failed to reach backend at {}", self.base_url))?;
        Self::check(response)
            .await?
            .text()
            .await
            .context("Failed to read backend response")
    }

    /// POST a JSON body. The response body is ignored.
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach backend at {}", self.base_url))?;
        Self::check(response).await
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or(text);
        anyhow::bail!("Request failed (status {}): {}", status, message)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;

    /// Serve `router` on a loopback port and return its base URL
    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_get_and_error_message() {
        let router = Router::new()
            .route(
                "/api/v1/replication/adapters",
                get(|| async { Json(json!(["harbor", "native"])) }),
            )
            .route(
                "/api/v1/replication/policies/7",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        Json(json!({"error": "policy 7 not found"})),
                    )
                }),
            );
        let url = serve(router).await;
        let client = ApiClient::new(Client::new(), &format!("{}/", url));

        let adapters: Vec<String> = client.get("/adapters").await.unwrap();
        assert_eq!(adapters, vec!["harbor", "native"]);

        let err = client
            .get::<serde_json::Value>("/policies/7")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Request failed (status 404 Not Found): policy 7 not found"
        );
    }
}
