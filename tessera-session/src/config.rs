//! Session configuration.

use crate::error::{SessionError, SessionResult};
use serde::Deserialize;
use std::time::Duration;
use tessera_lock::LockConfig;
use tessera_token::{DEFAULT_TOKEN_BYTES, MIN_TOKEN_BYTES};

/// Environment variable prefix used by [`SessionConfig::from_env`].
pub const ENV_PREFIX: &str = "TESSERA_SESSION";

/// Session backend type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionBackend {
    /// In-process store and locks
    #[default]
    Memory,
    /// Redis store and locks (requires the `redis` feature)
    Redis,
}

impl SessionBackend {
    fn parse(s: &str) -> SessionResult<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(SessionBackend::Memory),
            "redis" => Ok(SessionBackend::Redis),
            other => Err(SessionError::Config(format!(
                "unknown session backend `{}`",
                other
            ))),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend type
    pub backend: SessionBackend,
    /// Connection URL (Redis backend only)
    pub url: Option<String>,
    /// Key namespace/prefix
    pub namespace: String,
    /// Idle time after which a session expires
    pub default_ttl: Duration,
    /// Absolute lifetime cap (for security)
    pub max_ttl: Duration,
    /// Longest wait for a Shared/Exclusive section lock
    pub lock_timeout: Duration,
    /// Poll interval for remote locks
    pub lock_retry_interval: Duration,
    /// Lease after which an abandoned remote lock expires
    pub lock_lease_ttl: Duration,
    /// Language of new sessions
    pub default_lan_id: i64,
    /// Random bytes per session id and token
    pub token_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Memory,
            url: None,
            namespace: "session".to_string(),
            default_ttl: Duration::from_secs(3600),  // 1 hour
            max_ttl: Duration::from_secs(86400 * 7), // 7 days
            lock_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(50),
            lock_lease_ttl: Duration::from_secs(30),
            default_lan_id: 1,
            token_bytes: DEFAULT_TOKEN_BYTES,
        }
    }
}

/// Raw settings as found in a TOML file or the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionSettings {
    backend: Option<String>,
    url: Option<String>,
    namespace: Option<String>,
    ttl_secs: Option<u64>,
    max_ttl_secs: Option<u64>,
    lock_timeout_ms: Option<u64>,
    lock_retry_ms: Option<u64>,
    lock_lease_secs: Option<u64>,
    lan_id: Option<i64>,
    token_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    session: Option<SessionSettings>,
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> SessionResult<Option<T>> {
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|_| {
            SessionError::Config(format!("{}_{} has invalid value `{}`", ENV_PREFIX, name, value))
        })
    })
    .transpose()
}

impl SessionConfig {
    /// In-process configuration (the default).
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a Redis session configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_session::SessionConfig;
    ///
    /// let config = SessionConfig::redis("redis://localhost:6379").unwrap();
    /// assert!(SessionConfig::redis("http://localhost").is_err());
    /// ```
    pub fn redis(url: &str) -> SessionResult<Self> {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(SessionError::InvalidUrl(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(Self {
            backend: SessionBackend::Redis,
            url: Some(url.to_string()),
            ..Default::default()
        })
    }

    /// Load configuration from `TESSERA_SESSION_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> SessionResult<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load configuration through a custom variable lookup.
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use std::time::Duration;
    /// use tessera_session::SessionConfig;
    ///
    /// let vars = HashMap::from([("TESSERA_SESSION_TTL_SECS", "600")]);
    /// let config = SessionConfig::from_env_with(|k| vars.get(k).map(|v| v.to_string())).unwrap();
    /// assert_eq!(config.default_ttl, Duration::from_secs(600));
    /// ```
    pub fn from_env_with<F>(lookup: F) -> SessionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));

        let settings = SessionSettings {
            backend: var("BACKEND"),
            url: var("URL"),
            namespace: var("NAMESPACE"),
            ttl_secs: parse_var("TTL_SECS", var("TTL_SECS"))?,
            max_ttl_secs: parse_var("MAX_TTL_SECS", var("MAX_TTL_SECS"))?,
            lock_timeout_ms: parse_var("LOCK_TIMEOUT_MS", var("LOCK_TIMEOUT_MS"))?,
            lock_retry_ms: parse_var("LOCK_RETRY_MS", var("LOCK_RETRY_MS"))?,
            lock_lease_secs: parse_var("LOCK_LEASE_SECS", var("LOCK_LEASE_SECS"))?,
            lan_id: parse_var("LAN_ID", var("LAN_ID"))?,
            token_bytes: parse_var("TOKEN_BYTES", var("TOKEN_BYTES"))?,
        };

        Self::from_settings(settings)
    }

    /// Load configuration from the `[session]` table of a TOML document.
    ///
    /// ```
    /// use tessera_session::{SessionBackend, SessionConfig};
    ///
    /// let config = SessionConfig::from_toml_str(r#"
    ///     [session]
    ///     backend = "redis"
    ///     url = "redis://cache:6379"
    ///     lock_timeout_ms = 250
    /// "#).unwrap();
    /// assert_eq!(config.backend, SessionBackend::Redis);
    /// ```
    pub fn from_toml_str(source: &str) -> SessionResult<Self> {
        let file: SettingsFile =
            toml::from_str(source).map_err(|e| SessionError::Config(e.to_string()))?;
        Self::from_settings(file.session.unwrap_or_default())
    }

    fn from_settings(settings: SessionSettings) -> SessionResult<Self> {
        let mut config = match settings.backend.as_deref().map(SessionBackend::parse) {
            Some(Ok(SessionBackend::Redis)) => {
                let url = settings.url.as_deref().ok_or_else(|| {
                    SessionError::Config("the redis backend requires a url".to_string())
                })?;
                Self::redis(url)?
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(SessionBackend::Memory)) | None => Self {
                url: settings.url,
                ..Self::memory()
            },
        };

        if let Some(namespace) = settings.namespace {
            config.namespace = namespace;
        }
        if let Some(secs) = settings.ttl_secs {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.max_ttl_secs {
            config.max_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = settings.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.lock_retry_ms {
            config.lock_retry_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = settings.lock_lease_secs {
            config.lock_lease_ttl = Duration::from_secs(secs);
        }
        if let Some(lan_id) = settings.lan_id {
            config.default_lan_id = lan_id;
        }
        if let Some(bytes) = settings.token_bytes {
            config.token_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> SessionResult<()> {
        if self.default_ttl.is_zero() {
            return Err(SessionError::Config("session TTL must be positive".to_string()));
        }
        if self.max_ttl < self.default_ttl {
            return Err(SessionError::Config(format!(
                "maximum TTL {:?} is shorter than the default TTL {:?}",
                self.max_ttl, self.default_ttl
            )));
        }
        if self.token_bytes < MIN_TOKEN_BYTES {
            return Err(SessionError::Config(format!(
                "tokens need at least {} random bytes, got {}",
                MIN_TOKEN_BYTES, self.token_bytes
            )));
        }
        if self.namespace.is_empty() {
            return Err(SessionError::Config("namespace must not be empty".to_string()));
        }
        if self.backend == SessionBackend::Redis && self.url.is_none() {
            return Err(SessionError::Config(
                "the redis backend requires a url".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the session namespace/prefix.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the default session TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the maximum session lifetime.
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Set the section lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the remote lock retry interval.
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Set the remote lock lease.
    pub fn with_lock_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lock_lease_ttl = ttl;
        self
    }

    /// Set the language of new sessions.
    pub fn with_default_lan_id(mut self, lan_id: i64) -> Self {
        self.default_lan_id = lan_id;
        self
    }

    /// Set the random bytes per id/token.
    pub fn with_token_bytes(mut self, bytes: usize) -> Self {
        self.token_bytes = bytes;
        self
    }

    /// Lock manager configuration derived from this config.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::default()
            .with_namespace(self.namespace.clone())
            .with_timeout(self.lock_timeout)
            .with_retry_interval(self.lock_retry_interval)
            .with_lease_ttl(self.lock_lease_ttl)
    }

    /// Build a store key with namespace.
    pub fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind, id)
    }
}
