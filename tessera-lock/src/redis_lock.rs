//! Section locks shared between processes through Redis.
//!
//! Each section key maps to a writer key (`SET` with a lease) and a reader
//! hash (token -> lease deadline). All transitions run as Lua scripts so that
//! checking and taking a lock is atomic. Deadlines are computed from the Redis
//! server clock, never from the clients'.

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::manager::{Hold, LockHandle, LockManager, SectionKey};
use crate::mode::LockMode;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const ACQUIRE_EXCLUSIVE: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        return 0
    end
    local t = redis.call("time")
    local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
    local readers = redis.call("hgetall", KEYS[2])
    for i = 1, #readers, 2 do
        if tonumber(readers[i + 1]) > now then
            return 0
        end
        redis.call("hdel", KEYS[2], readers[i])
    end
    redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
"#;

const ACQUIRE_SHARED: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        return 0
    end
    local t = redis.call("time")
    local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
    redis.call("hset", KEYS[2], ARGV[1], now + tonumber(ARGV[2]))
    redis.call("pexpire", KEYS[2], ARGV[2])
    return 1
"#;

const RELEASE_EXCLUSIVE: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

const RELEASE_SHARED: &str = r#"
    return redis.call("hdel", KEYS[2], ARGV[1])
"#;

const RENEW_EXCLUSIVE: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        redis.call("pexpire", KEYS[1], ARGV[2])
        return 1
    end
    return 0
"#;

const RENEW_SHARED: &str = r#"
    local deadline = redis.call("hget", KEYS[2], ARGV[1])
    local t = redis.call("time")
    local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
    if not deadline or tonumber(deadline) <= now then
        redis.call("hdel", KEYS[2], ARGV[1])
        return 0
    end
    redis.call("hset", KEYS[2], ARGV[1], now + tonumber(ARGV[2]))
    if redis.call("pttl", KEYS[2]) < tonumber(ARGV[2]) then
        redis.call("pexpire", KEYS[2], ARGV[2])
    end
    return 1
"#;

/// A lease held in Redis.
pub(crate) struct RemoteHold {
    writer_key: String,
    reader_key: String,
    token: String,
    exclusive: bool,
    conn: ConnectionManager,
    released: bool,
}

impl RemoteHold {
    fn release_script(&self) -> redis::Script {
        redis::Script::new(if self.exclusive {
            RELEASE_EXCLUSIVE
        } else {
            RELEASE_SHARED
        })
    }

    /// Extend the lease by `lease` if this hold still owns it.
    async fn renew(&self, lease: Duration) -> LockResult<bool> {
        let script = redis::Script::new(if self.exclusive {
            RENEW_EXCLUSIVE
        } else {
            RENEW_SHARED
        });
        let mut conn = self.conn.clone();
        let renewed: i32 = script
            .key(&self.writer_key)
            .key(&self.reader_key)
            .arg(&self.token)
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            trace!(key = %self.writer_key, "Renewed section lease");
        } else {
            warn!(key = %self.writer_key, "Section lease lapsed before renewal");
        }
        Ok(renewed == 1)
    }

    async fn release(mut self) -> LockResult<()> {
        self.released = true;
        let mut conn = self.conn.clone();
        let result: i32 = self
            .release_script()
            .key(&self.writer_key)
            .key(&self.reader_key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if result == 1 {
            debug!(key = %self.writer_key, "Released section lease");
            Ok(())
        } else {
            warn!(key = %self.writer_key, "Section lease was no longer held (expired?)");
            Err(LockError::NotHeld(self.writer_key.clone()))
        }
    }
}

impl Drop for RemoteHold {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Best effort release on drop
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.writer_key, "No runtime to release section lease; it will expire");
            return;
        };

        let script = self.release_script();
        let writer_key = self.writer_key.clone();
        let reader_key = self.reader_key.clone();
        let token = self.token.clone();
        let mut conn = self.conn.clone();

        runtime.spawn(async move {
            let _: Result<i32, _> = script
                .key(&writer_key)
                .key(&reader_key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
        });
    }
}

/// Redis-backed lock manager
///
/// # Examples
///
/// ```rust,ignore
/// use tessera_lock::{LockConfig, LockManager, LockMode, RedisLockManager, SectionKey};
///
/// let client = redis::Client::open("redis://127.0.0.1/")?;
/// let conn = client.get_connection_manager().await?;
/// let locks = RedisLockManager::new(conn, LockConfig::default());
///
/// let handle = locks.acquire(&SectionKey::new("ses", "cart"), LockMode::Exclusive).await?;
/// locks.release(handle).await?;
/// ```
pub struct RedisLockManager {
    conn: ConnectionManager,
    config: LockConfig,
}

impl RedisLockManager {
    pub fn new(conn: ConnectionManager, config: LockConfig) -> Self {
        Self { conn, config }
    }

    /// Connect to `url` and create a lock manager.
    pub async fn connect(url: &str, config: LockConfig) -> LockResult<Self> {
        debug!(url = %url, "Connecting to Redis for section locks");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, config))
    }

    fn writer_key(&self, key: &SectionKey) -> String {
        format!(
            "{}:lock:{}:{}",
            self.config.namespace, key.session_id, key.section
        )
    }

    async fn try_lease(
        &self,
        writer_key: &str,
        reader_key: &str,
        token: &str,
        exclusive: bool,
    ) -> LockResult<bool> {
        let script = redis::Script::new(if exclusive {
            ACQUIRE_EXCLUSIVE
        } else {
            ACQUIRE_SHARED
        });
        let lease_ms = self.config.lease_ttl.as_millis() as u64;

        let mut conn = self.conn.clone();
        let acquired: i32 = script
            .key(writer_key)
            .key(reader_key)
            .arg(token)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(acquired == 1)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire_timeout(
        &self,
        key: &SectionKey,
        mode: LockMode,
        timeout: Duration,
    ) -> LockResult<LockHandle> {
        if !mode.blocks() {
            return Ok(LockHandle::new(key.clone(), mode, Duration::ZERO, Hold::Free));
        }

        let exclusive = mode == LockMode::Exclusive;
        let writer_key = self.writer_key(key);
        let reader_key = format!("{}:readers", writer_key);
        let token = Uuid::new_v4().to_string();
        let start = Instant::now();

        loop {
            if self
                .try_lease(&writer_key, &reader_key, &token, exclusive)
                .await?
            {
                let waited = start.elapsed();
                debug!(key = %key, mode = %mode, waited = ?waited, "Acquired section lease");
                let hold = RemoteHold {
                    writer_key,
                    reader_key,
                    token: token.clone(),
                    exclusive,
                    conn: self.conn.clone(),
                    released: false,
                };
                return Ok(LockHandle::with_token(
                    key.clone(),
                    mode,
                    token,
                    waited,
                    Hold::Remote(hold),
                ));
            }

            if start.elapsed() >= timeout {
                warn!(key = %key, mode = %mode, "Timed out waiting for section lease");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: start.elapsed(),
                });
            }

            trace!(key = %key, "Section lease busy, retrying");
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    async fn release(&self, mut handle: LockHandle) -> LockResult<()> {
        match handle.take_hold() {
            Hold::Free => Ok(()),
            Hold::Remote(hold) => hold.release().await,
            Hold::Local(_) => Err(LockError::NotHeld(format!(
                "{} was not acquired from this Redis lock manager",
                handle.key()
            ))),
        }
    }

    async fn renew(&self, handle: &LockHandle) -> LockResult<bool> {
        match handle.hold() {
            Hold::Free => Ok(true),
            Hold::Remote(hold) => hold.renew(self.config.lease_ttl).await,
            Hold::Local(_) => Err(LockError::NotHeld(format!(
                "{} was not acquired from this Redis lock manager",
                handle.key()
            ))),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
