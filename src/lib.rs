// Tessera - lock-aware web sessions for Rust
//
// This library bundles the session core with its token provider and section
// lock manager, so applications depend on a single crate.

// Re-export the session core
pub use tessera_session::*;

// Re-export the building blocks
pub use tessera_lock;
pub use tessera_token;

pub use tessera_lock::{LockConfig, LockError, LockHandle, LockManager, LockMode, SectionKey};
pub use tessera_token::{RandomTokenProvider, TokenError, TokenProvider, tokens_match};

#[cfg(feature = "redis")]
pub use tessera_lock::RedisLockManager;

pub mod prelude {
    pub use crate::{
        LockMode,
        SaveReport,
        SectionOutcome,
        SectionStore,
        SectionValue,
        Session,
        SessionConfig,
        SessionError,
        SessionManager,
        SessionResult,
        SessionState,
        TokenProvider,
        UserIdentity,
    };
}
