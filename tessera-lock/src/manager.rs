//! Lock manager trait and lock handles.

use crate::error::{LockError, LockResult};
use crate::local::LocalHold;
use crate::mode::LockMode;
use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[cfg(feature = "redis")]
use crate::redis_lock::RemoteHold;

/// Identifies one named section of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionKey {
    pub session_id: String,
    pub section: String,
}

impl SectionKey {
    pub fn new(session_id: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            section: section.into(),
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.section)
    }
}

/// What a handle keeps alive until it is released.
pub(crate) enum Hold {
    /// Non-blocking modes hold nothing.
    Free,
    Local(LocalHold),
    #[cfg(feature = "redis")]
    Remote(RemoteHold),
}

/// Request-scoped lock on a named section.
///
/// The lock is released when the handle is dropped, including on early
/// returns and error paths. [`LockManager::release`] releases explicitly and
/// reports whether the lock was still held.
pub struct LockHandle {
    key: SectionKey,
    mode: LockMode,
    token: String,
    acquired_at: Instant,
    waited: Duration,
    hold: Hold,
}

impl LockHandle {
    pub(crate) fn new(key: SectionKey, mode: LockMode, waited: Duration, hold: Hold) -> Self {
        Self {
            key,
            mode,
            token: Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            waited,
            hold,
        }
    }

    /// Create a handle whose lock is already owned by `hold`, sharing its token.
    #[cfg(feature = "redis")]
    pub(crate) fn with_token(
        key: SectionKey,
        mode: LockMode,
        token: String,
        waited: Duration,
        hold: Hold,
    ) -> Self {
        Self {
            key,
            mode,
            token,
            acquired_at: Instant::now(),
            waited,
            hold,
        }
    }

    pub fn key(&self) -> &SectionKey {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Unique token identifying this acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// How long the handle has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// How long acquisition waited for other holders.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Whether the handle keeps other acquirers out (Shared or Exclusive).
    pub fn is_blocking(&self) -> bool {
        !matches!(self.hold, Hold::Free)
    }

    #[cfg(feature = "redis")]
    pub(crate) fn hold(&self) -> &Hold {
        &self.hold
    }

    pub(crate) fn take_hold(&mut self) -> Hold {
        std::mem::replace(&mut self.hold, Hold::Free)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("token", &self.token)
            .field("waited", &self.waited)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

/// Arbitrates access to named sections.
///
/// Callers acquire one section at a time and never nest acquisitions across
/// sections without releasing, so no lock ordering protocol is needed.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `key` in `mode`, waiting at most `timeout` for other holders.
    async fn acquire_timeout(
        &self,
        key: &SectionKey,
        mode: LockMode,
        timeout: Duration,
    ) -> LockResult<LockHandle>;

    /// Release a handle.
    async fn release(&self, handle: LockHandle) -> LockResult<()>;

    /// Confirm `handle` still holds its lock and push its lease out again.
    ///
    /// Returns `false` when the lock was lost, e.g. because a lease expired
    /// and someone else took the section. Holds that cannot lapse are always
    /// still held.
    async fn renew(&self, _handle: &LockHandle) -> LockResult<bool> {
        Ok(true)
    }

    /// Timeout used by [`LockManager::acquire`].
    fn default_timeout(&self) -> Duration;

    /// Backend name for logging.
    fn backend(&self) -> &'static str;

    // ========== Convenience Methods ==========

    /// Acquire with the configured timeout.
    async fn acquire(&self, key: &SectionKey, mode: LockMode) -> LockResult<LockHandle> {
        self.acquire_timeout(key, mode, self.default_timeout())
            .await
    }

    /// Acquire only if no wait is needed.
    async fn try_acquire(
        &self,
        key: &SectionKey,
        mode: LockMode,
    ) -> LockResult<Option<LockHandle>> {
        match self.acquire_timeout(key, mode, Duration::ZERO).await {
            Ok(handle) => Ok(Some(handle)),
            Err(LockError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
