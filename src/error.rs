//! # Error Handling
//!
//! HTTP-facing error type. Every handler returns [`AppResult`], and actix
//! turns an [`AppError`] into a JSON body through [`ResponseError`]:
//!
//! ```json
//! {"error": {"type": "capacity_exceeded", "message": "...", "timestamp": "..."}}
//! ```
//!
//! Session-local failures (malformed frames, provider errors) never reach
//! this type; the relay turns them into `error` control frames instead. Only
//! failures that happen before a session exists, or on the operational API,
//! surface here.

use crate::claims::ClaimsError;
use crate::session::registry::RegistryError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Session registry is full; the WebSocket upgrade is refused
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An external collaborator (claims store) failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::Upstream(_) => "upstream_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::CapacityExceeded(msg)
            | AppError::Upstream(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { .. } => AppError::CapacityExceeded(err.to_string()),
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}

impl From<ClaimsError> for AppError {
    fn from(err: ClaimsError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
