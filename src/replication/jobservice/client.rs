use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{JobBackend, JobData, JobServiceError};

#[derive(Debug, Deserialize)]
struct SubmittedJob {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job: SubmittedJob,
}

/// Client for a remote job service speaking the `/api/v1/jobs` protocol
pub struct HttpJobServiceClient {
    endpoint: String,
    secret: String,
    http: reqwest::Client,
}

impl HttpJobServiceClient {
    pub fn new(endpoint: &str, secret: &str, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            http,
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(
            reqwest::header::AUTHORIZATION,
            format!("Harbor-Secret {}", self.secret),
        )
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        job_id: Option<&str>,
    ) -> Result<reqwest::Response, JobServiceError> {
        let response = self.authorized(builder).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = job_id {
                return Err(JobServiceError::NotFound(id.to_string()));
            }
        }
        let message = response.text().await.unwrap_or_default();
        Err(JobServiceError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl JobBackend for HttpJobServiceClient {
    async fn submit(&self, job: &JobData) -> Result<String, JobServiceError> {
        let body = serde_json::json!({ "job": job });
        let response = self
            .send(
                self.http
                    .post(format!("{}/api/v1/jobs", self.endpoint))
                    .json(&body),
                None,
            )
            .await?;
        let submitted: SubmitResponse = response.json().await?;
        debug!(job_id = %submitted.job.id, "Submitted job to remote job service");
        Ok(submitted.job.id)
    }

    async fn stop(&self, job_id: &str) -> Result<(), JobServiceError> {
        self.send(
            self.http
                .post(format!("{}/api/v1/jobs/{}", self.endpoint, job_id))
                .json(&serde_json::json!({ "action": "stop" })),
            Some(job_id),
        )
        .await?;
        Ok(())
    }

    async fn get_log(&self, job_id: &str) -> Result<String, JobServiceError> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/api/v1/jobs/{}/log", self.endpoint, job_id)),
                Some(job_id),
            )
            .await?;
        Ok(response.text().await?)
    }
}
