//! Error types for both sides of the registry.
//!
//! [`ApiError`] maps server-side failures onto HTTP responses with the
//! `{success: false, error: {code, message}}` body. [`RegistryError`] is
//! what [`crate::RegistryClient`] callers see.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Structured error detail in API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    /// Machine-readable error code (e.g., "NOT_FOUND").
    pub code: String,
    pub message: String,
}

/// Server-side errors with HTTP status code mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Entry not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request (400).
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        };

        let body = serde_json::json!({
            "success": false,
            "error": ApiErrorDetail {
                code: code.to_string(),
                message,
            },
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Errors returned by the registry client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The service could not be reached or answered garbage.
    #[error("registry unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with an error status.
    #[error("registry rejected {op}: {status} {message}")]
    Rejected {
        op: &'static str,
        status: u16,
        message: String,
    },

    /// Retries ran past the caller's deadline.
    #[error("timeout during registry {op}")]
    Timeout { op: &'static str },
}

impl RegistryError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Transport(_) => true,
            RegistryError::Rejected { status, .. } => *status >= 500,
            RegistryError::Timeout { .. } => false,
        }
    }
}
