//! Lock-aware sessions with named sections for Tessera.
//!
//! A session carries the identity of a visitor (user, profile, language,
//! CSRF and session tokens) plus any number of **named sections**: small
//! documents that concurrent requests of the same session lock and persist
//! independently of each other.
//!
//! # Request Flow
//!
//! 1. Build one [`SessionManager`] at startup.
//! 2. Per request, call [`SessionManager::session`] and [`Session::start`]
//!    with the id the transport presented (e.g. a cookie value).
//! 3. Acquire sections with [`Session::get_named_section`] in the mode the
//!    request needs and mutate them in memory.
//! 4. Call [`Session::save`] to write modified sections back and release
//!    every section lock.
//!
//! # Lock Modes
//!
//! - `Shared` - many holders; last writer wins
//! - `Exclusive` - one holder; others wait up to the lock timeout
//! - `ReadOnly` - never blocks, never written
//! - `FirstComeFirstServed` - never blocks; a write based on a stale copy
//!   is rejected and reported in the [`SaveReport`]
//!
//! # Features
//!
//! - `redis` - Redis section store and lock manager
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use tessera_session::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::in_memory(SessionConfig::default())?;
//!
//! let mut session = manager.session();
//! session.start(None).await?;
//! session.login(42)?;
//!
//! let prefs = session.get_named_section("prefs", LockMode::Exclusive).await?;
//! prefs.insert("theme".into(), json!("dark"));
//!
//! let report = session.save().await?;
//! assert!(report.is_success());
//! assert_eq!(
//!     report.outcome("prefs"),
//!     Some(&SectionOutcome::Written { version: 1 })
//! );
//! # Ok::<(), SessionError>(())
//! # }).unwrap();
//! ```
//!
//! ## First Come, First Served
//!
//! ```
//! use serde_json::json;
//! use tessera_session::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::in_memory(SessionConfig::default())?;
//! let mut first = manager.session();
//! let id = first.start(None).await?.to_string();
//!
//! let mut second = manager.session();
//! second.start(Some(&id)).await?;
//!
//! first.get_named_section("form", LockMode::FirstComeFirstServed).await?;
//! second.get_named_section("form", LockMode::FirstComeFirstServed).await?;
//!
//! assert!(first.save_named_section("form", &json!({"by": "first"})).await?);
//! assert!(!second.save_named_section("form", &json!({"by": "second"})).await?);
//! # Ok::<(), SessionError>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod memory_store;
pub mod section;
pub mod session;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use config::{ENV_PREFIX, SessionBackend, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use memory_store::MemorySectionStore;
pub use section::{SaveReport, SectionOutcome};
pub use session::{MAX_SESSION_ID_LEN, Session, SessionState, UserIdentity};
pub use store::{
    IdentityChange, Precondition, PutOutcome, RecordChanges, SectionEntry, SectionStore,
    SectionValue, SessionRecord,
};

#[cfg(feature = "redis")]
pub use redis_store::RedisSectionStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{SessionBackend, SessionConfig};
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::manager::SessionManager;
    pub use crate::section::{SaveReport, SectionOutcome};
    pub use crate::session::{Session, SessionState, UserIdentity};
    pub use crate::store::{SectionStore, SectionValue};
    pub use tessera_lock::LockMode;

    #[cfg(feature = "redis")]
    pub use crate::redis_store::RedisSectionStore;
}
