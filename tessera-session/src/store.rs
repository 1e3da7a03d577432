//! Section store trait definition.

use crate::error::SessionResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Content of a named section. An empty map is the same as an absent section.
pub type SectionValue = serde_json::Map<String, serde_json::Value>;

/// Durable state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier
    pub id: String,
    /// Logged in user, `None` for anonymous sessions
    pub usr_id: Option<i64>,
    /// Profile of the logged in user
    pub pro_id: Option<i64>,
    /// Preferred language
    pub lan_id: i64,
    /// Secret rotated on every authentication change
    pub session_token: String,
    /// Double-submit CSRF token
    pub csrf_token: String,
    /// Whether a flash message is pending for the next page
    pub has_flash_message: bool,
    /// Session creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last access timestamp
    pub last_accessed_at: DateTime<Utc>,
    /// Session expiration timestamp
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create an anonymous session record.
    pub fn new(
        id: impl Into<String>,
        session_token: impl Into<String>,
        csrf_token: impl Into<String>,
        lan_id: i64,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            usr_id: None,
            pro_id: None,
            lan_id,
            session_token: session_token.into(),
            csrf_token: csrf_token.into(),
            has_flash_message: false,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_anonymous(&self) -> bool {
        self.usr_id.is_none()
    }

    /// Update the last accessed timestamp.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Push expiration to `ttl` from now, never past `max_lifetime` after creation.
    pub fn extend(&mut self, ttl: Duration, max_lifetime: Duration) {
        let sliding = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let cap = self.created_at + chrono::Duration::from_std(max_lifetime).unwrap_or_default();
        self.expires_at = sliding.min(cap);
    }

    /// Time left before expiration (zero once expired).
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or_default()
    }

    /// Apply a request's changes, touch the record and slide its expiry.
    pub fn refresh(&mut self, changes: &RecordChanges, ttl: Duration, max_lifetime: Duration) {
        if let Some(identity) = &changes.identity {
            identity.apply_to(self);
        }
        if let Some(lan_id) = changes.lan_id {
            self.lan_id = lan_id;
        }
        if let Some(has_flash_message) = changes.has_flash_message {
            self.has_flash_message = has_flash_message;
        }
        self.touch();
        self.extend(ttl, max_lifetime);
    }
}

/// User and tokens set by a login or logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityChange {
    pub usr_id: Option<i64>,
    pub pro_id: Option<i64>,
    pub session_token: String,
    pub csrf_token: String,
}

impl IdentityChange {
    pub fn apply_to(&self, record: &mut SessionRecord) {
        record.usr_id = self.usr_id;
        record.pro_id = self.pro_id;
        record.session_token.clone_from(&self.session_token);
        record.csrf_token.clone_from(&self.csrf_token);
    }
}

/// Record fields changed by one request.
///
/// Stores merge these into the record as currently stored, so fields the
/// request did not change keep whatever other requests wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordChanges {
    pub identity: Option<IdentityChange>,
    pub lan_id: Option<i64>,
    pub has_flash_message: Option<bool>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.identity.is_none() && self.lan_id.is_none() && self.has_flash_message.is_none()
    }
}

/// A stored section together with its version stamp.
///
/// Deleting a section leaves a tombstone (`value: None`) that keeps the
/// version, so stamps never repeat for the same section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SectionEntry {
    pub value: Option<SectionValue>,
    pub version: u64,
}

impl SectionEntry {
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Condition a section write must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional (last writer wins)
    None,
    /// Only if the stored version still equals this one (0 = never written)
    Version(u64),
}

/// Result of a section write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written { version: u64 },
    Deleted { version: u64 },
    /// The precondition failed; nothing was written
    Conflict { current: u64 },
}

/// Durable backend for session records and their named sections.
///
/// Every section write must be atomic on its own; no cross-section
/// transactions are assumed.
#[async_trait]
pub trait SectionStore: Send + Sync {
    /// Persist a newly allocated session.
    async fn create_session(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Get a session by ID.
    ///
    /// Returns `Ok(None)` if not found or expired; expired records are removed.
    async fn load_session(&self, session_id: &str) -> SessionResult<Option<SessionRecord>>;

    /// Merge `changes` into the stored record, touch it and extend its expiry
    /// (see [`SessionRecord::refresh`]).
    ///
    /// The merge is atomic against other updates of the same record. Returns
    /// the merged record, or `None` (writing nothing) when the record no
    /// longer exists, so a destroyed session is never resurrected.
    async fn update_session(
        &self,
        session_id: &str,
        changes: &RecordChanges,
        ttl: Duration,
        max_lifetime: Duration,
    ) -> SessionResult<Option<SessionRecord>>;

    /// Delete a session and all of its sections.
    async fn delete_session(&self, session_id: &str) -> SessionResult<bool>;

    /// IDs of the live sessions of a user.
    async fn sessions_of_user(&self, usr_id: i64) -> SessionResult<Vec<String>>;

    /// Load a named section, `None` if it was never written.
    async fn load_section(
        &self,
        session_id: &str,
        name: &str,
    ) -> SessionResult<Option<SectionEntry>>;

    /// Write (`Some`, non-empty) or delete (`None` or empty) a named section.
    ///
    /// Fails with `NotFound` if the session record is gone.
    async fn put_section(
        &self,
        session_id: &str,
        name: &str,
        value: Option<&SectionValue>,
        precondition: Precondition,
    ) -> SessionResult<PutOutcome>;

    /// Get the number of active sessions.
    async fn count(&self) -> SessionResult<usize>;

    /// Cleanup expired sessions.
    ///
    /// Backends with native expiry return 0.
    async fn cleanup_expired(&self) -> SessionResult<usize>;

    /// Store type name for logging.
    fn store_type(&self) -> &'static str;

    // ========== Convenience Methods ==========

    /// Delete every session of a user except `except`.
    async fn delete_sessions_of_user(
        &self,
        usr_id: i64,
        except: Option<&str>,
    ) -> SessionResult<usize> {
        let mut deleted = 0;
        for session_id in self.sessions_of_user(usr_id).await? {
            if except == Some(session_id.as_str()) {
                continue;
            }
            if self.delete_session(&session_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
