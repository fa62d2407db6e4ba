//! Error types for the gateway.
//!
//! [`Error`] covers process bootstrap and bubbles up to `main`.
//! [`ApiError`] covers request handling; every handler returns it, and it
//! is turned into an HTTP response in exactly one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fngate_code_store::StoreError;
use fngate_sandbox::{ExecutionError, SyntaxError};
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] fngate_sandbox::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] fngate_http::Error),

    #[error("Metric error: {0}")]
    Metric(#[from] fngate_metrics::Error),

    #[error("Invalid code item schema: {message}")]
    Schema { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No worker could be started")]
    NoWorkers,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }
}

/// A failed request.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// The body does not match the code item schema.
    #[error("Invalid instance: {}", .details.join("; "))]
    Validation { details: Vec<String> },

    #[error("{}: {}", .0.error, .0.details.join("; "))]
    Syntax(SyntaxError),

    #[error("The key {namespace}:{id} already exists")]
    Conflict { namespace: String, id: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidQuery(String),

    /// A run request whose body cannot be handed to a function.
    #[error("{0}")]
    InvalidBody(String),

    #[error(transparent)]
    InvalidKey(StoreError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Execution(ExecutionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. }
            | ApiError::Syntax(_)
            | ApiError::Conflict { .. }
            | ApiError::InvalidQuery(_)
            | ApiError::InvalidBody(_)
            | ApiError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Execution(e) => StatusCode::from_u16(e.status_or_default())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Log the failure under a request's context prefix.
    pub fn log(&self, prefix: &str, action: &str) {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(prefix, status = status.as_u16(), "{}: {}", action, self);
        } else {
            tracing::warn!(prefix, status = status.as_u16(), "{}: {}", action, self);
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        if error.is_invalid_key() {
            ApiError::InvalidKey(error)
        } else {
            ApiError::Store(error)
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(error: ExecutionError) -> Self {
        ApiError::Execution(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Validation { details } => (
                status,
                Json(ErrorResponse {
                    error: "Invalid instance".to_string(),
                    details: Some(details),
                }),
            )
                .into_response(),
            ApiError::Syntax(syntax) => (status, Json(syntax)).into_response(),
            ApiError::Execution(e) => (status, Json(ErrorResponse::new(e.message))).into_response(),
            other => (status, Json(ErrorResponse::new(other.to_string()))).into_response(),
        }
    }
}
