//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metamcp_shared::StoreError;
use serde_json::json;

use crate::mcp::TransportError;
use crate::pool::PoolError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid API key")]
    InvalidApiKey,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unsupported transport type: {0}")]
    InvalidTransportType(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Conflict: {0}")]
    Conflict(String),

    // Backend errors
    #[error("Backend connection failed: {0}")]
    BackendSetup(String),
    #[error("Backend rejected credentials: {0}")]
    BackendUnauthorized(String),
    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "INVALID_API_KEY", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidTransportType(_) => (StatusCode::BAD_REQUEST, "INVALID_TRANSPORT_TYPE", self.to_string()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::SessionNotFound => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Backend
            ApiError::BackendSetup(_) => (StatusCode::BAD_GATEWAY, "BACKEND_SETUP_FAILED", self.to_string()),
            ApiError::BackendUnauthorized(_) => (StatusCode::UNAUTHORIZED, "BACKEND_UNAUTHORIZED", self.to_string()),
            ApiError::BackendTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "BACKEND_TIMEOUT", self.to_string()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidTransportType(selector) => ApiError::InvalidTransportType(selector),
            TransportError::InvalidArguments(e) => ApiError::Validation(e.to_string()),
            TransportError::Unauthorized(url) => ApiError::BackendUnauthorized(url),
            e @ TransportError::Timeout { .. } => ApiError::BackendTimeout(e.to_string()),
            e => {
                tracing::error!(error = %e, "Backend transport error");
                ApiError::BackendSetup(e.to_string())
            }
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ShuttingDown => ApiError::ServiceUnavailable,
            PoolError::UnknownApiKey => ApiError::InvalidApiKey,
            PoolError::Setup(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::Validation(msg) => ApiError::Validation(msg),
            e => {
                tracing::error!(error = %e, "Configuration store error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
