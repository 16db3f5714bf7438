// Authentication and authorization error types

use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::auth::models::Role;
use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Token generation error: {0}")]
    TokenGenerationError(String),

    /// Contains the required role and the caller's actual role
    #[error("Insufficient permissions: required role '{required}', but caller has role '{actual}'")]
    InsufficientPermissions { required: Role, actual: Role },
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientPermissions { required, .. } => {
                ApiError::Forbidden(format!("Insufficient permissions: required role '{}'", required))
            }
            AuthError::TokenGenerationError(msg) => {
                tracing::error!("Token generation error: {}", msg);
                ApiError::Unauthorized("Could not issue token".to_string())
            }
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
