//! Error types for session operations.

use crate::session::SessionState;
use std::time::Duration;
use tessera_lock::{LockError, LockMode};
use tessera_token::TokenError;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session-specific errors.
///
/// Conflicting first-come-first-served writes are not errors: they are
/// reported through [`crate::SectionOutcome::Conflict`] and
/// `save_named_section` returning `false`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation not valid in the current lifecycle state
    #[error("Operation `{operation}` is invalid for a session in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Exclusive (or shared) section acquisition exceeded the configured wait
    #[error("Timed out after {waited:?} waiting for section {key}")]
    LockTimeout { key: String, waited: Duration },

    /// Section already acquired by this request in another mode
    #[error("Section `{section}` is held as {held}, cannot reacquire as {requested}")]
    ModeConflict {
        section: String,
        held: LockMode,
        requested: LockMode,
    },

    /// Any other lock manager failure
    #[error("Lock error: {0}")]
    Lock(LockError),

    /// Backing store I/O failure
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// Session record not found (expired or destroyed)
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Token provider error
    #[error("Token error: {0}")]
    Token(#[from] TokenError),
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, waited } => SessionError::LockTimeout { key, waited },
            other => SessionError::Lock(other),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_conversion() {
        let err: SessionError = LockError::Timeout {
            key: "abc/cart".to_string(),
            waited: Duration::from_millis(10),
        }
        .into();
        assert!(matches!(err, SessionError::LockTimeout { ref key, .. } if key == "abc/cart"));
    }

    #[test]
    fn test_other_lock_errors_wrapped() {
        let err: SessionError = LockError::NotHeld("abc/cart".to_string()).into();
        assert!(matches!(err, SessionError::Lock(LockError::NotHeld(_))));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = SessionError::InvalidState {
            operation: "login",
            state: SessionState::Destroyed,
        };
        assert_eq!(
            err.to_string(),
            "Operation `login` is invalid for a session in state destroyed"
        );
    }
}
