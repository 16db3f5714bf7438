// Error handling module for the loyalty API
// Provides the HTTP-facing error type and its JSON response format

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::loyalty::LoyaltyError;

/// Main error type for the HTTP layer
/// All handlers return Result<T, ApiError>
#[derive(Debug)]
pub enum ApiError {
    /// Request body or query failed validation
    /// Maps to HTTP 400 Bad Request
    ValidationError(validator::ValidationErrors),

    /// Malformed request that is not a field-level validation issue
    /// Maps to HTTP 400 Bad Request
    BadRequest(String),

    /// Domain failure from the loyalty engine
    /// Status and code come from the error itself
    Loyalty(LoyaltyError),

    /// Authentication failures
    /// Maps to HTTP 401 Unauthorized
    Unauthorized(String),

    /// Authorization failures
    /// Maps to HTTP 403 Forbidden
    Forbidden(String),
}

/// Consistent error response structure
///
/// Every error response carries both a machine-readable `error_code` and a
/// human-readable `message`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error_code: String,

    pub message: String,

    /// Optional additional details (e.g., field-level validation errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// ISO 8601 timestamp of when the error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    fn new(error_code: &str, message: String, details: Option<serde_json::Value>) -> Self {
        Self {
            error_code: error_code.to_string(),
            message,
            details,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = self.to_error_response();
        (status, Json(error_response)).into_response()
    }
}

impl ApiError {
    /// Convert ApiError to HTTP status code and ErrorResponse
    ///
    /// Server-side failures are logged in full and replaced by a generic
    /// message; client errors are logged at debug or warn.
    fn to_error_response(&self) -> (StatusCode, ErrorResponse) {
        match self {
            ApiError::ValidationError(errors) => {
                debug!("Validation error: {:?}", errors);
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new(
                        "validation_error",
                        "Request validation failed".to_string(),
                        Some(serde_json::to_value(errors).unwrap_or(serde_json::json!({}))),
                    ),
                )
            }
            ApiError::BadRequest(message) => {
                debug!("Bad request: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new("bad_request", message.clone(), None),
                )
            }
            ApiError::Loyalty(err) => {
                let status = err.status_code();
                let message = if err.is_client_facing() {
                    if status == StatusCode::CONFLICT {
                        warn!("Loyalty conflict: {}", err);
                    } else {
                        debug!("Loyalty request rejected: {}", err);
                    }
                    err.to_string()
                } else {
                    error!("Loyalty internal error: {:?}", err);
                    match err {
                        LoyaltyError::Database(_) => "A database error occurred".to_string(),
                        _ => "An internal server error occurred".to_string(),
                    }
                };
                (status, ErrorResponse::new(err.reason_code(), message, None))
            }
            ApiError::Unauthorized(message) => {
                warn!("Unauthorized access attempt: {}", message);
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorResponse::new("unauthorized", message.clone(), None),
                )
            }
            ApiError::Forbidden(message) => {
                warn!("Forbidden access attempt: {}", message);
                (
                    StatusCode::FORBIDDEN,
                    ErrorResponse::new("forbidden", message.clone(), None),
                )
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ValidationError(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Loyalty(err) => err.status_code(),
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl From<LoyaltyError> for ApiError {
    fn from(error: LoyaltyError) -> Self {
        ApiError::Loyalty(error)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::Loyalty(LoyaltyError::Database(error))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors)
    }
}
