// Error types for the loyalty ledger
// Every failure carries a stable machine-readable reason code

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::error::ApiError;

/// Main error type for loyalty operations
///
/// Guard short-circuits in the order lifecycle are not errors; they are
/// reported through `LifecycleOutcome`. Everything here is either a rejected
/// request or a storage failure.
#[derive(Debug, Error)]
pub enum LoyaltyError {
    /// The program, or the redemption half of it, is switched off
    #[error("Loyalty {0} is disabled")]
    FeatureDisabled(&'static str),

    /// Caller is not tied to a customer account
    #[error("You must be logged in to redeem points")]
    UnauthenticatedAccount,

    /// Non-positive or otherwise unusable point amount
    #[error("Invalid points amount: {0}")]
    InvalidAmount(i64),

    /// More points requested than the account holds
    #[error("Requested {requested} points but only {available} are available")]
    InsufficientBalance { requested: i64, available: i64 },

    /// Redemption request under the configured minimum
    #[error("Minimum {minimum} points required to redeem.")]
    BelowMinimumRedemption { minimum: i64 },

    /// Rejected settings update or malformed request data
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Referenced record does not exist
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// A posting plan produced numbers that do not add up
    #[error("Ledger posting rejected: {0}")]
    ConcurrencyAnomaly(String),

    /// Stored ledger data that no longer parses
    #[error("Corrupt ledger row: {0}")]
    CorruptEntry(String),

    /// Storage engine failure, propagated to the caller unchanged
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Settings document could not be (de)serialised
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for loyalty operations
pub type LoyaltyResult<T> = Result<T, LoyaltyError>;

impl LoyaltyError {
    /// Stable code surfaced to customers and API clients
    pub fn reason_code(&self) -> &'static str {
        match self {
            LoyaltyError::FeatureDisabled(_) => "feature_disabled",
            LoyaltyError::UnauthenticatedAccount => "not_logged_in",
            LoyaltyError::InvalidAmount(_) => "invalid_points",
            LoyaltyError::InsufficientBalance { .. } => "invalid_points",
            LoyaltyError::BelowMinimumRedemption { .. } => "below_minimum",
            LoyaltyError::InvalidSettings(_) => "invalid_settings",
            LoyaltyError::NotFound { .. } => "not_found",
            LoyaltyError::ConcurrencyAnomaly(_) => "concurrency_anomaly",
            LoyaltyError::CorruptEntry(_) => "corrupt_entry",
            LoyaltyError::Database(_) => "database_error",
            LoyaltyError::Json(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LoyaltyError::FeatureDisabled(_) => StatusCode::FORBIDDEN,
            LoyaltyError::UnauthenticatedAccount => StatusCode::UNAUTHORIZED,
            LoyaltyError::InvalidAmount(_)
            | LoyaltyError::InsufficientBalance { .. }
            | LoyaltyError::BelowMinimumRedemption { .. }
            | LoyaltyError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            LoyaltyError::NotFound { .. } => StatusCode::NOT_FOUND,
            LoyaltyError::ConcurrencyAnomaly(_) => StatusCode::CONFLICT,
            LoyaltyError::CorruptEntry(_) | LoyaltyError::Database(_) | LoyaltyError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the message may be shown to API clients as-is
    pub fn is_client_facing(&self) -> bool {
        self.status_code() != StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl From<validator::ValidationErrors> for LoyaltyError {
    fn from(err: validator::ValidationErrors) -> Self {
        LoyaltyError::InvalidSettings(err.to_string())
    }
}

impl IntoResponse for LoyaltyError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = LoyaltyError::BelowMinimumRedemption { minimum: 100 };
        assert_eq!(error.to_string(), "Minimum 100 points required to redeem.");

        let error = LoyaltyError::InsufficientBalance {
            requested: 500,
            available: 20,
        };
        assert_eq!(
            error.to_string(),
            "Requested 500 points but only 20 are available"
        );

        let error = LoyaltyError::FeatureDisabled("redemption");
        assert_eq!(error.to_string(), "Loyalty redemption is disabled");
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(LoyaltyError::InvalidAmount(0).reason_code(), "invalid_points");
        assert_eq!(
            LoyaltyError::InsufficientBalance {
                requested: 2,
                available: 1
            }
            .reason_code(),
            "invalid_points"
        );
        assert_eq!(
            LoyaltyError::BelowMinimumRedemption { minimum: 1 }.reason_code(),
            "below_minimum"
        );
        assert_eq!(
            LoyaltyError::FeatureDisabled("program").reason_code(),
            "feature_disabled"
        );
        assert_eq!(
            LoyaltyError::UnauthenticatedAccount.reason_code(),
            "not_logged_in"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            LoyaltyError::UnauthenticatedAccount.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            LoyaltyError::FeatureDisabled("program").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            LoyaltyError::InvalidAmount(-3).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LoyaltyError::NotFound {
                resource: "Order",
                id: "7".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_from_sqlx() {
        let err: LoyaltyError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, LoyaltyError::Database(_)));
        assert!(!err.is_client_facing());
    }
}
