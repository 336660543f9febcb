//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use story_engine_core::ports::PortError;
use story_engine_core::ReportRejected;
use tracing::error;

use crate::config::ConfigError;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a failure to apply the schema migrations at startup.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The request itself is malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The caller did not present the credential the endpoint requires.
    #[error("Unauthorized")]
    Unauthorized,

    /// The write targets rows or fields only the server maintains.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Port(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Port(PortError::MissingCollection(_)) => StatusCode::NOT_FOUND,
            ApiError::Port(PortError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Port(PortError::InvalidFilter(_)) => StatusCode::BAD_REQUEST,
            ApiError::Port(PortError::Serialization(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ReportRejected> for ApiError {
    fn from(rejected: ReportRejected) -> Self {
        ApiError::BadRequest(rejected.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {:?}", self);
            // Internal details stay in the log.
            return (status, "Internal server error".to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}
