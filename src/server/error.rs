use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::replication::controller::ControllerError;
use crate::replication::execution::ExecutionError;
use crate::replication::jobservice::JobServiceError;

/// API error: logged when it becomes a response, rendered to the client as
/// `{"error": message}`. The source chain and context are only logged.
#[derive(Debug)]
pub struct ServerError {
    /// HTTP status code to return
    pub status: StatusCode,
    /// User-facing error message (returned in response)
    pub message: String,
    /// Internal error with full chain (logged but not exposed to client)
    pub source: Option<anyhow::Error>,
    /// Structured context for logging (key-value pairs)
    pub context: Vec<(&'static str, String)>,
}

impl ServerError {
    /// Create a new error with just status and message (no source error)
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            context: Vec::new(),
        }
    }

    /// Create an error from an anyhow::Error with full error chain
    pub fn from_anyhow(
        source: anyhow::Error,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            source: Some(source),
            context: Vec::new(),
        }
    }

    /// Add a context field for logging (chainable)
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Create a 500 Internal Server Error from an anyhow::Error
    pub fn internal_anyhow(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(source, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 403 Forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// Create a 404 Not Found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Create a 409 Conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Log server errors (5xx) with full context using structured fields
        if self.status.is_server_error() {
            // Log with structured fields to prevent log injection
            if let Some(source) = &self.source {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    error = ?source,
                    "Server error"
                );
            } else {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    "Server error"
                );
            }
        }

        // Return clean JSON error response to client
        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<ControllerError> for ServerError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::PolicyNotFound(_)
            | ControllerError::Execution(ExecutionError::ExecutionNotFound(_))
            | ControllerError::Execution(ExecutionError::TaskNotFound(_))
            | ControllerError::Execution(ExecutionError::TaskMismatch { .. }) => {
                Self::not_found(err.to_string())
            }
            ControllerError::PolicyDisabled(_) => Self::conflict(err.to_string()),
            ControllerError::InvalidPolicy(_) | ControllerError::InvalidResource(_) => {
                Self::bad_request(err.to_string())
            }
            ControllerError::JobService(JobServiceError::NotFound(id)) => {
                Self::not_found(format!("job {} not found", id))
            }
            ControllerError::JobService(e) => {
                Self::from_anyhow(e.into(), StatusCode::BAD_GATEWAY, "Job service request failed")
            }
            ControllerError::Internal(e) => match e.downcast_ref::<ExecutionError>() {
                Some(inner) => Self::not_found(inner.to_string()),
                None => Self::internal_anyhow(e, "Internal server error"),
            },
        }
    }
}

/// Map any error convertible to anyhow into a 500 with a client-facing message
pub trait ServerErrorExt<T> {
    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError>;
}

impl<T, E> ServerErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::internal_anyhow(e.into(), message))
    }
}
