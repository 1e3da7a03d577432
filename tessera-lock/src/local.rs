//! In-process lock manager.
//!
//! Keeps one async reader/writer lock per section key in a DashMap registry.
//! Suitable for single-instance deployments and tests; for multiple processes
//! sharing a store, use the Redis lock manager.

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::manager::{Hold, LockHandle, LockManager, SectionKey};
use crate::mode::LockMode;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, trace, warn};

type Registry = DashMap<SectionKey, Arc<RwLock<()>>>;

enum LocalGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Guard plus the bookkeeping needed to prune the registry on release.
pub(crate) struct LocalHold {
    guard: Option<LocalGuard>,
    key: SectionKey,
    registry: Arc<Registry>,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let kind = match guard {
                LocalGuard::Read(_) => "shared",
                LocalGuard::Write(_) => "exclusive",
            };
            drop(guard);
            trace!(key = %self.key, kind, "Released local section lock");
        }
        prune(&self.registry, &self.key);
    }
}

/// Drop the registry entry once nobody holds or waits for it.
fn prune(registry: &Registry, key: &SectionKey) {
    registry.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

/// In-process lock manager
pub struct LocalLockManager {
    registry: Arc<Registry>,
    config: LockConfig,
}

impl LocalLockManager {
    /// Create a new in-process lock manager
    pub fn new(config: LockConfig) -> Self {
        debug!(timeout = ?config.timeout, "Creating local lock manager");
        Self {
            registry: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of section keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.registry.len()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire_timeout(
        &self,
        key: &SectionKey,
        mode: LockMode,
        timeout: Duration,
    ) -> LockResult<LockHandle> {
        if !mode.blocks() {
            trace!(key = %key, mode = %mode, "Non-blocking section acquisition");
            return Ok(LockHandle::new(key.clone(), mode, Duration::ZERO, Hold::Free));
        }

        let started = Instant::now();
        let lock = Arc::clone(
            self.registry
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .value(),
        );

        trace!(key = %key, mode = %mode, timeout = ?timeout, "Waiting for section lock");

        let guard = if mode == LockMode::Exclusive {
            tokio::time::timeout(timeout, lock.write_owned())
                .await
                .map(LocalGuard::Write)
        } else {
            tokio::time::timeout(timeout, lock.read_owned())
                .await
                .map(LocalGuard::Read)
        };

        match guard {
            Ok(guard) => {
                let waited = started.elapsed();
                debug!(key = %key, mode = %mode, waited = ?waited, "Acquired section lock");
                let hold = LocalHold {
                    guard: Some(guard),
                    key: key.clone(),
                    registry: self.registry.clone(),
                };
                Ok(LockHandle::new(key.clone(), mode, waited, Hold::Local(hold)))
            }
            Err(_) => {
                let waited = started.elapsed();
                prune(&self.registry, key);
                warn!(key = %key, mode = %mode, waited = ?waited, "Timed out waiting for section lock");
                Err(LockError::Timeout {
                    key: key.to_string(),
                    waited,
                })
            }
        }
    }

    async fn release(&self, mut handle: LockHandle) -> LockResult<()> {
        match handle.take_hold() {
            Hold::Free => Ok(()),
            Hold::Local(hold) => {
                drop(hold);
                Ok(())
            }
            #[cfg(feature = "redis")]
            Hold::Remote(_) => Err(LockError::NotHeld(format!(
                "{} was not acquired from this local lock manager",
                handle.key()
            ))),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
