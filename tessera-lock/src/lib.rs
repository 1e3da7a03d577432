//! Section Locks for Tessera
//!
//! This crate arbitrates concurrent access to the named sections of a
//! session. Locks are taken per `(session id, section name)`, so requests that
//! touch disjoint sections of the same session never contend.
//!
//! ## Lock Modes
//!
//! | Mode | Blocks | Holders |
//! |---|---|---|
//! | `Shared` | only behind an `Exclusive` holder | many |
//! | `Exclusive` | behind any holder | one |
//! | `ReadOnly` | never | many, nothing is ever persisted |
//! | `FirstComeFirstServed` | never | many, conflicts detected at save |
//!
//! ## Backends
//!
//! - **Local** - In-process registry of async reader/writer locks
//! - **Redis** - Leases shared by every process (`redis` feature)
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_lock::*;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let locks = LocalLockManager::new(
//!     LockConfig::default().with_timeout(Duration::from_millis(50)),
//! );
//! let key = SectionKey::new("ses-1", "cart");
//!
//! let held = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
//!
//! // A second exclusive acquirer times out while the first holds the lock
//! let err = locks.acquire(&key, LockMode::Exclusive).await.unwrap_err();
//! assert!(err.is_timeout());
//!
//! // Dropping (or releasing) the handle frees the lock
//! locks.release(held).await.unwrap();
//! assert!(locks.acquire(&key, LockMode::Exclusive).await.is_ok());
//! # });
//! ```

pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod mode;

#[cfg(feature = "redis")]
pub mod redis_lock;

pub use config::LockConfig;
pub use error::{LockError, LockResult};
pub use local::LocalLockManager;
pub use manager::{LockHandle, LockManager, SectionKey};
pub use mode::LockMode;

#[cfg(feature = "redis")]
pub use redis_lock::RedisLockManager;
