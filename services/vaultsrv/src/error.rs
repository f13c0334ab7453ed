//! Unified error handling for VaultSrv
//!
//! One enum covers the domain taxonomy plus infrastructure failures, with a
//! direct Axum response mapping. Notification failures deliberately do NOT
//! appear here as a caller-facing variant: a failed channel is captured in
//! the operation's result, never escalated into the error path.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::domain::Phase;

/// Result type alias
pub type Result<T> = std::result::Result<T, VaultError>;

/// Vault service error types
#[derive(Debug, Error)]
pub enum VaultError {
    /// No such protected message
    #[error("message not found: {0}")]
    NotFound(String),

    /// Duplicate start; carries the phase set by the first acceptance
    #[error("escalation already in progress (phase {phase})")]
    AlreadyInProgress { phase: Phase },

    /// The record already reached a terminal phase. Not a failure for the
    /// caller - surfaced as an "already resolved" no-op outcome.
    #[error("message already resolved (phase {phase})")]
    AlreadyTerminal { phase: Phase },

    /// Malformed, forged or owner-mismatched confirmation token
    #[error("invalid confirmation token")]
    InvalidToken,

    /// No matching unconsumed, unexpired fast-lane code
    #[error("fast-lane verification failed")]
    VerificationFailed,

    /// Lost a compare-and-swap race; state already advanced elsewhere
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    /// Invalid request input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Genuine storage I/O failure (not a race)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else; reported as temporarily unavailable
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<vault_token::TokenError> for VaultError {
    fn from(_: vault_token::TokenError) -> Self {
        VaultError::InvalidToken
    }
}

impl From<anyhow::Error> for VaultError {
    fn from(err: anyhow::Error) -> Self {
        VaultError::Internal(err.to_string())
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            VaultError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            VaultError::AlreadyInProgress { .. } => (StatusCode::CONFLICT, self.to_string()),
            VaultError::AlreadyTerminal { .. } => (StatusCode::CONFLICT, self.to_string()),
            VaultError::InvalidToken => (StatusCode::BAD_REQUEST, self.to_string()),
            VaultError::VerificationFailed => (StatusCode::UNAUTHORIZED, self.to_string()),
            VaultError::StorageConflict(_) => (StatusCode::CONFLICT, self.to_string()),
            VaultError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            VaultError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            VaultError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
            ),
            VaultError::Internal(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Temporarily unavailable".to_string(),
            ),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = VaultError::NotFound("abc-123".to_string());
        assert_eq!(format!("{}", error), "message not found: abc-123");

        let error = VaultError::AlreadyInProgress {
            phase: Phase::Stage(2),
        };
        assert!(format!("{}", error).contains("phase_2"));
    }

    #[test]
    fn test_token_error_maps_to_invalid_token() {
        let error: VaultError = vault_token::TokenError::BadSignature.into();
        assert!(matches!(error, VaultError::InvalidToken));
    }
}
