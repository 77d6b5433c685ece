//! Error types for the GPU memory sharing plugin.
//!
//! Store and registry failures have their own enums so the allocation path can
//! classify them; `PluginError` is the crate-level error used at startup and by
//! the non-allocation HTTP endpoints.

use std::time::Duration;

use thiserror::Error;

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors reported by a workload metadata store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("workload {0} was modified concurrently; resource version is stale")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed store object: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether the error is an optimistic-concurrency version conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Unavailable(format!("request timed out: {err}"))
        } else if err.is_connect() {
            StoreError::Unavailable(format!("connection error: {err}"))
        } else if err.is_decode() {
            StoreError::Malformed(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Errors raised while building the device registry at startup
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no usable GPU devices found")]
    NoDevices,

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("invalid device specification '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{resource_type} not found: {resource_id}")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("invalid input for field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        PluginError::Config(msg.into())
    }

    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        PluginError::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl axum::response::IntoResponse for PluginError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        let (status, error_type) = match &self {
            PluginError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PluginError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
            PluginError::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
            PluginError::Serialization(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            PluginError::Store(StoreError::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            PluginError::Store(_) => (StatusCode::BAD_GATEWAY, "store_error"),
            PluginError::Registry(_) | PluginError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = Json(serde_json::json!({
            "error": error_type,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
