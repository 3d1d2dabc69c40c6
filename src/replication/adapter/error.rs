use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no adapter factory registered for registry type '{0}'")]
    NoFactory(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry returned {status}: {message}")]
    Registry { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("{0} is not supported by this registry")]
    Unsupported(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl AdapterError {
    /// Map a non-success registry response to an error variant
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("").to_string()
        } else {
            body
        };
        match status {
            StatusCode::NOT_FOUND => AdapterError::NotFound(message),
            StatusCode::UNAUTHORIZED => AdapterError::Unauthorized(message),
            StatusCode::FORBIDDEN => AdapterError::Forbidden(message),
            StatusCode::CONFLICT => AdapterError::Conflict(message),
            _ => AdapterError::Registry {
                status: status.as_u16(),
                message,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AdapterError::Conflict(_))
    }
}

/// Turn a non-success response into an `AdapterError`, passing successes through
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AdapterError::from_status(status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(AdapterError::from_status(StatusCode::NOT_FOUND, String::new()).is_not_found());
        assert!(AdapterError::from_status(StatusCode::CONFLICT, "exists".into()).is_conflict());
        assert!(matches!(
            AdapterError::from_status(StatusCode::UNAUTHORIZED, String::new()),
            AdapterError::Unauthorized(_)
        ));
        match AdapterError::from_status(StatusCode::BAD_GATEWAY, String::new()) {
            AdapterError::Registry { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Bad Gateway");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
