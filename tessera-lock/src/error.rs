//! Lock errors.

use std::time::Duration;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Section lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: String, waited: Duration },

    #[error("Lock not held: {0}")]
    NotHeld(String),

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl LockError {
    /// Whether this error is a bounded wait that expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}
