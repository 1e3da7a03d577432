//! Shared session services and the per-request session factory.

use crate::config::{SessionBackend, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::memory_store::MemorySectionStore;
use crate::session::Session;
use crate::store::SectionStore;
use std::fmt;
use std::sync::Arc;
use tessera_lock::{LocalLockManager, LockManager};
use tessera_token::{RandomTokenProvider, TokenProvider};
use tracing::{debug, info};

struct ManagerInner {
    config: SessionConfig,
    store: Arc<dyn SectionStore>,
    locks: Arc<dyn LockManager>,
    tokens: Arc<dyn TokenProvider>,
}

/// Owns the store, lock manager and token provider shared by all requests.
///
/// Cheap to clone. Build one at startup and call [`SessionManager::session`]
/// once per request.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    /// In-process store and locks.
    pub fn in_memory(config: SessionConfig) -> SessionResult<Self> {
        Self::builder().config(config).build()
    }

    /// Create a manager for the backend named in `config`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tessera_session::{SessionConfig, SessionManager};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = SessionConfig::from_env()?;
    /// let manager = SessionManager::from_config(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn from_config(config: SessionConfig) -> SessionResult<Self> {
        match config.backend {
            SessionBackend::Memory => Self::in_memory(config),
            #[cfg(feature = "redis")]
            SessionBackend::Redis => {
                let url = config.url.clone().ok_or_else(|| {
                    SessionError::Config("the redis backend requires a url".to_string())
                })?;
                let store = crate::redis_store::RedisSectionStore::new(config.clone()).await?;
                let locks =
                    tessera_lock::RedisLockManager::connect(&url, config.lock_config()).await?;
                Self::builder()
                    .config(config)
                    .store(Arc::new(store))
                    .locks(Arc::new(locks))
                    .build()
            }
            #[cfg(not(feature = "redis"))]
            SessionBackend::Redis => Err(SessionError::Config(
                "the redis backend requires the `redis` feature".to_string(),
            )),
        }
    }

    /// Session for one request. Call [`Session::start`] before use.
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &dyn SectionStore {
        self.inner.store.as_ref()
    }

    pub fn locks(&self) -> &dyn LockManager {
        self.inner.locks.as_ref()
    }

    pub fn tokens(&self) -> &dyn TokenProvider {
        self.inner.tokens.as_ref()
    }

    /// Destroy every stored session of `usr_id`.
    ///
    /// Requests already running on those sessions keep their in-memory state,
    /// but cannot save it and their ids no longer resume.
    pub async fn destroy_all_sessions_of_user(&self, usr_id: i64) -> SessionResult<usize> {
        let destroyed = self.store().delete_sessions_of_user(usr_id, None).await?;
        info!(usr_id, destroyed, "Destroyed all sessions of user");
        Ok(destroyed)
    }

    /// Number of live sessions.
    pub async fn count(&self) -> SessionResult<usize> {
        self.store().count().await
    }

    /// Remove expired sessions from stores without native expiry.
    pub async fn cleanup_expired(&self) -> SessionResult<usize> {
        self.store().cleanup_expired().await
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("namespace", &self.inner.config.namespace)
            .field("store", &self.inner.store.store_type())
            .field("locks", &self.inner.locks.backend())
            .finish()
    }
}

/// Builder for [`SessionManager`].
///
/// Components not supplied default to the in-process implementations built
/// from the configuration.
#[derive(Default)]
pub struct SessionManagerBuilder {
    config: Option<SessionConfig>,
    store: Option<Arc<dyn SectionStore>>,
    locks: Option<Arc<dyn LockManager>>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn SectionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn build(self) -> SessionResult<SessionManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store: Arc<dyn SectionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemorySectionStore::new()),
        };
        let locks: Arc<dyn LockManager> = match self.locks {
            Some(locks) => locks,
            None => Arc::new(LocalLockManager::new(config.lock_config())),
        };
        let tokens: Arc<dyn TokenProvider> = match self.tokens {
            Some(tokens) => tokens,
            None => Arc::new(RandomTokenProvider::new(config.token_bytes)?),
        };

        debug!(
            namespace = %config.namespace,
            store = store.store_type(),
            locks = locks.backend(),
            "Created session manager"
        );

        Ok(SessionManager {
            inner: Arc::new(ManagerInner {
                config,
                store,
                locks,
                tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedTokens;

    impl TokenProvider for FixedTokens {
        fn generate_session_id(&self) -> String {
            "fixed-id".to_string()
        }

        fn generate_token(&self) -> String {
            "fixed-token".to_string()
        }
    }

    #[test]
    fn test_builder_defaults() {
        let manager = SessionManager::builder().build().unwrap();
        assert_eq!(manager.store().store_type(), "memory");
        assert_eq!(manager.locks().backend(), "local");
        assert_eq!(manager.locks().default_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = SessionManager::in_memory(SessionConfig::default().with_token_bytes(4));
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_custom_token_provider() {
        let manager = SessionManager::builder()
            .tokens(Arc::new(FixedTokens))
            .build()
            .unwrap();
        let mut session = manager.session();
        assert_eq!(session.start(None).await.unwrap(), "fixed-id");
        assert_eq!(session.csrf_token(), Some("fixed-token"));
    }

    #[tokio::test]
    async fn test_destroy_all_sessions_of_user() {
        let manager = SessionManager::in_memory(SessionConfig::default()).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut session = manager.session();
            ids.push(session.start(None).await.unwrap().to_string());
            session.login(11).unwrap();
            session.save().await.unwrap();
        }

        assert_eq!(manager.count().await.unwrap(), 3);
        assert_eq!(manager.destroy_all_sessions_of_user(11).await.unwrap(), 3);
        assert_eq!(manager.count().await.unwrap(), 0);
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_backend_needs_feature() {
        let config = SessionConfig::redis("redis://localhost:6379").unwrap();
        assert!(matches!(
            SessionManager::from_config(config).await,
            Err(SessionError::Config(_))
        ));
    }
}
