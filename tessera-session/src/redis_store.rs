//! Redis section store.
//!
//! Layout per session (all keys prefixed with the configured namespace):
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `ses:{id}` | string | JSON [`SessionRecord`], `PX` = remaining TTL |
//! | `sec:{id}` | hash | section name -> JSON section value |
//! | `ver:{id}` | hash | section name -> version stamp |
//! | `usr:{usr_id}` | set | session ids of the user |
//!
//! Section hashes follow the record's expiry. Writes that must not race run
//! as Lua scripts.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::store::{
    Precondition, PutOutcome, RecordChanges, SectionEntry, SectionStore, SectionValue,
    SessionRecord,
};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Replace the record only if it still holds the JSON the update was computed
/// from (ARGV[1]), and carry the section hashes along to the new expiry.
/// Returns 0 when the record is gone, -1 when it changed meanwhile.
const UPDATE_SESSION: &str = r#"
    local current = redis.call("get", KEYS[1])
    if not current then
        return 0
    end
    if current ~= ARGV[1] then
        return -1
    end
    redis.call("set", KEYS[1], ARGV[2], "PX", ARGV[3])
    redis.call("pexpire", KEYS[2], ARGV[3])
    redis.call("pexpire", KEYS[3], ARGV[3])
    return 1
"#;

/// Attempts before a record update that keeps racing gives up.
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Returns `{status, version}`: -1 no session, 0 conflict, 1 written,
/// 2 deleted. ARGV[2] is the expected version or "" for none.
const PUT_SECTION: &str = r#"
    local ttl = redis.call("pttl", KEYS[1])
    if ttl < 0 then
        return {-1, 0}
    end
    local current = tonumber(redis.call("hget", KEYS[3], ARGV[1]) or "0")
    if ARGV[2] ~= "" and tonumber(ARGV[2]) ~= current then
        return {0, current}
    end
    local version = current + 1
    redis.call("hset", KEYS[3], ARGV[1], version)
    redis.call("pexpire", KEYS[3], ttl)
    if ARGV[3] == "" then
        redis.call("hdel", KEYS[2], ARGV[1])
        return {2, version}
    end
    redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
    redis.call("pexpire", KEYS[2], ttl)
    return {1, version}
"#;

/// Redis-backed section store.
///
/// # Examples
///
/// ```no_run
/// use tessera_session::{RedisSectionStore, SectionStore, SessionConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SessionConfig::redis("redis://localhost:6379")?.with_namespace("shop");
/// let store = RedisSectionStore::new(config).await?;
/// println!("{} live sessions", store.count().await?);
/// # Ok(())
/// # }
/// ```
pub struct RedisSectionStore {
    conn: ConnectionManager,
    config: SessionConfig,
}

impl RedisSectionStore {
    /// Connect to the configured URL.
    pub async fn new(config: SessionConfig) -> SessionResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SessionError::Config("the redis backend requires a url".to_string()))?;
        debug!(url = %url, namespace = %config.namespace, "Connecting Redis section store");

        let client =
            redis::Client::open(url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;

        Ok(Self::with_connection(conn, config))
    }

    /// Use an existing connection.
    pub fn with_connection(conn: ConnectionManager, config: SessionConfig) -> Self {
        Self { conn, config }
    }

    fn record_key(&self, session_id: &str) -> String {
        self.config.key("ses", session_id)
    }

    fn sections_key(&self, session_id: &str) -> String {
        self.config.key("sec", session_id)
    }

    fn versions_key(&self, session_id: &str) -> String {
        self.config.key("ver", session_id)
    }

    fn user_key(&self, usr_id: i64) -> String {
        self.config.key("usr", &usr_id.to_string())
    }

    fn encode(record: &SessionRecord) -> SessionResult<String> {
        serde_json::to_string(record).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    fn decode(json: &str) -> SessionResult<SessionRecord> {
        serde_json::from_str(json).map_err(|e| SessionError::Deserialization(e.to_string()))
    }

    fn ttl_ms(record: &SessionRecord) -> u64 {
        (record.remaining_ttl().as_millis() as u64).max(1)
    }

    async fn index_user(&self, record: &SessionRecord) -> SessionResult<()> {
        if let Some(usr_id) = record.usr_id {
            let key = self.user_key(usr_id);
            let mut conn = self.conn.clone();
            let _: () = conn.sadd(&key, &record.id).await?;
            let _: () = conn
                .pexpire(&key, self.config.max_ttl.as_millis() as i64)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SectionStore for RedisSectionStore {
    async fn create_session(&self, record: &SessionRecord) -> SessionResult<()> {
        let json = Self::encode(record)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(self.record_key(&record.id), json, Self::ttl_ms(record))
            .await?;
        self.index_user(record).await
    }

    async fn load_session(&self, session_id: &str) -> SessionResult<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(self.record_key(session_id)).await?;

        match data {
            Some(json) => {
                let record = Self::decode(&json)?;

                if record.is_expired() {
                    self.delete_session(session_id).await?;
                    return Ok(None);
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn update_session(
        &self,
        session_id: &str,
        changes: &RecordChanges,
        ttl: Duration,
        max_lifetime: Duration,
    ) -> SessionResult<Option<SessionRecord>> {
        let record_key = self.record_key(session_id);
        let mut conn = self.conn.clone();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current: Option<String> = conn.get(&record_key).await?;
            let Some(current) = current else {
                return Ok(None);
            };
            let previous = Self::decode(&current)?;
            if previous.is_expired() {
                self.delete_session(session_id).await?;
                return Ok(None);
            }

            let mut record = previous.clone();
            record.refresh(changes, ttl, max_lifetime);

            let status: i32 = redis::Script::new(UPDATE_SESSION)
                .key(&record_key)
                .key(self.sections_key(session_id))
                .key(self.versions_key(session_id))
                .arg(&current)
                .arg(Self::encode(&record)?)
                .arg(Self::ttl_ms(&record))
                .invoke_async(&mut conn)
                .await?;

            match status {
                1 => {
                    if previous.usr_id != record.usr_id {
                        if let Some(usr_id) = previous.usr_id {
                            let _: () = conn.srem(self.user_key(usr_id), session_id).await?;
                        }
                    }
                    self.index_user(&record).await?;
                    return Ok(Some(record));
                }
                0 => return Ok(None),
                _ => trace!(session_id = %session_id, attempt, "Session record changed meanwhile, retrying"),
            }
        }

        warn!(session_id = %session_id, attempts = MAX_UPDATE_ATTEMPTS, "Gave up updating contended session record");
        Err(SessionError::StoreUnavailable(format!(
            "session record {} kept changing during update",
            session_id
        )))
    }

    async fn delete_session(&self, session_id: &str) -> SessionResult<bool> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.get(self.record_key(session_id)).await?;

        let deleted: usize = conn
            .del(vec![
                self.record_key(session_id),
                self.sections_key(session_id),
                self.versions_key(session_id),
            ])
            .await?;

        if let Some(usr_id) = record
            .and_then(|json| serde_json::from_str::<SessionRecord>(&json).ok())
            .and_then(|r| r.usr_id)
        {
            let _: () = conn.srem(self.user_key(usr_id), session_id).await?;
        }

        trace!(session_id = %session_id, deleted, "Deleted session keys");
        Ok(deleted > 0)
    }

    async fn sessions_of_user(&self, usr_id: i64) -> SessionResult<Vec<String>> {
        let key = self.user_key(usr_id);
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(&key).await?;

        let mut live = Vec::with_capacity(members.len());
        for session_id in members {
            let exists: bool = conn.exists(self.record_key(&session_id)).await?;
            if exists {
                live.push(session_id);
            } else {
                let _: () = conn.srem(&key, &session_id).await?;
            }
        }
        live.sort();
        Ok(live)
    }

    async fn load_section(
        &self,
        session_id: &str,
        name: &str,
    ) -> SessionResult<Option<SectionEntry>> {
        let mut conn = self.conn.clone();
        let (value, version): (Option<String>, Option<u64>) = redis::pipe()
            .atomic()
            .hget(self.sections_key(session_id), name)
            .hget(self.versions_key(session_id), name)
            .query_async(&mut conn)
            .await?;

        let Some(version) = version else {
            return Ok(None);
        };
        let value = value
            .map(|json| {
                serde_json::from_str::<SectionValue>(&json)
                    .map_err(|e| SessionError::Deserialization(e.to_string()))
            })
            .transpose()?;

        Ok(Some(SectionEntry { value, version }))
    }

    async fn put_section(
        &self,
        session_id: &str,
        name: &str,
        value: Option<&SectionValue>,
        precondition: Precondition,
    ) -> SessionResult<PutOutcome> {
        let payload = match value.filter(|v| !v.is_empty()) {
            Some(value) => serde_json::to_string(value)
                .map_err(|e| SessionError::Serialization(e.to_string()))?,
            None => String::new(),
        };
        let expected = match precondition {
            Precondition::None => String::new(),
            Precondition::Version(version) => version.to_string(),
        };

        let mut conn = self.conn.clone();
        let (status, version): (i64, u64) = redis::Script::new(PUT_SECTION)
            .key(self.record_key(session_id))
            .key(self.sections_key(session_id))
            .key(self.versions_key(session_id))
            .arg(name)
            .arg(expected)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        trace!(session_id = %session_id, section = %name, status, version, "Section write");

        match status {
            1 => Ok(PutOutcome::Written { version }),
            2 => Ok(PutOutcome::Deleted { version }),
            0 => Ok(PutOutcome::Conflict { current: version }),
            _ => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    async fn count(&self) -> SessionResult<usize> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.config.key("ses", "*"))
            .query_async(&mut conn)
            .await?;
        Ok(keys.len())
    }

    async fn cleanup_expired(&self) -> SessionResult<usize> {
        // Redis expires keys on its own
        Ok(0)
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
