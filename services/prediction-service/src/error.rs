use axum::{http::StatusCode, response::IntoResponse, Json};
use model_registry::{LoadError, RegistryError};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to callers of the serving API.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid canary config: {0}")]
    InvalidConfig(String),
    #[error("no model loaded")]
    NotReady,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Logs(#[from] LogStoreError),
}

impl ServeError {
    /// Label used for the `iris_api_errors_total{kind}` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::InvalidInput(_) => "invalid_input",
            ServeError::InvalidConfig(_) => "invalid_config",
            ServeError::NotReady => "not_ready",
            ServeError::Load(_) => "model_load",
            ServeError::Registry(_) => "registry",
            ServeError::Logs(_) => "log_store",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::InvalidInput(_) | ServeError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServeError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Load(_) | ServeError::Registry(_) | ServeError::Logs(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Failures of the durable prediction log. Never reach API callers on the predict path.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log storage: {0}")]
    Storage(#[from] sled::Error),
    #[error("log codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("duplicate request id {0}")]
    Duplicate(String),
    #[error("log store unavailable: {0}")]
    Unavailable(String),
}
