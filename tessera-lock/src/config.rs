//! Lock manager configuration.

use std::time::Duration;

/// Lock manager configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Key prefix for backends that share a keyspace
    pub namespace: String,
    /// Longest a blocking acquisition may wait
    pub timeout: Duration,
    /// Poll interval for backends that cannot park waiters (Redis)
    pub retry_interval: Duration,
    /// Lease after which an abandoned remote lock expires
    pub lease_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: "session".to_string(),
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the acquisition timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the remote lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}
