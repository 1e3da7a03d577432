//! The per-request session.

use crate::error::{SessionError, SessionResult};
use crate::manager::SessionManager;
use crate::section::{AcquiredSection, SaveReport, SectionOutcome, to_section_value};
use crate::store::{IdentityChange, RecordChanges, SectionValue, SessionRecord};
use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use tessera_lock::{LockMode, SectionKey};
use tessera_token::tokens_match;
use tracing::{debug, info, warn};

/// Longest session id accepted from the transport.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// `start` has not been called yet
    Unstarted,
    Anonymous,
    Authenticated,
    /// The session record was deleted; every further operation fails
    Destroyed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticated => "authenticated",
            SessionState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User attached to a session on login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub usr_id: i64,
    pub pro_id: Option<i64>,
}

impl UserIdentity {
    pub fn new(usr_id: i64) -> Self {
        Self {
            usr_id,
            pro_id: None,
        }
    }

    pub fn with_profile(mut self, pro_id: i64) -> Self {
        self.pro_id = Some(pro_id);
        self
    }
}

/// Whether an id presented by the transport is worth looking up.
fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Session state of one request.
///
/// Created by [`SessionManager::session`] and passed explicitly to whatever
/// handles the request. Named sections are acquired lazily, mutated in
/// memory, and written back by [`Session::save`], which also releases their
/// locks. Dropping the session releases the locks without writing.
///
/// Changes to the session itself (user, tokens, language, flash flag) are
/// persisted by `save` as well. Only the fields this request changed are
/// written; the rest keep what concurrent requests stored.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tessera_lock::LockMode;
/// use tessera_session::{SessionConfig, SessionManager};
///
/// # tokio_test::block_on(async {
/// let manager = SessionManager::in_memory(SessionConfig::default()).unwrap();
///
/// // First request: no cookie yet
/// let mut session = manager.session();
/// let id = session.start(None).await.unwrap().to_string();
/// session
///     .get_named_section("cart", LockMode::Exclusive)
///     .await
///     .unwrap()
///     .insert("items".into(), json!(3));
/// session.save().await.unwrap();
///
/// // Second request presents the cookie
/// let mut session = manager.session();
/// session.start(Some(&id)).await.unwrap();
/// let cart = session.get_named_section("cart", LockMode::ReadOnly).await.unwrap();
/// assert_eq!(cart["items"], json!(3));
/// # });
/// ```
pub struct Session {
    manager: SessionManager,
    state: SessionState,
    record: Option<SessionRecord>,
    changes: RecordChanges,
    sections: HashMap<String, AcquiredSection>,
    is_new: bool,
}

impl Session {
    pub(crate) fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            state: SessionState::Unstarted,
            record: None,
            changes: RecordChanges::default(),
            sections: HashMap::new(),
            is_new: false,
        }
    }

    // ========== Lifecycle ==========

    /// Resume the session named by `presented`, or start a new one.
    ///
    /// Unknown, expired and malformed ids all lead to a fresh session. Calling
    /// `start` again within the same request is a no-op and returns the same id.
    pub async fn start(&mut self, presented: Option<&str>) -> SessionResult<&str> {
        match self.state {
            SessionState::Destroyed => return Err(self.invalid("start")),
            SessionState::Unstarted => self.resume_or_create(presented).await?,
            SessionState::Anonymous | SessionState::Authenticated => {}
        }
        self.ses_id().ok_or(SessionError::InvalidState {
            operation: "start",
            state: self.state,
        })
    }

    async fn resume_or_create(&mut self, presented: Option<&str>) -> SessionResult<()> {
        let store = self.manager.store();

        let existing = match presented {
            Some(id) if is_well_formed_id(id) => store.load_session(id).await?,
            Some(id) => {
                warn!(len = id.len(), "Ignoring malformed session id");
                None
            }
            None => None,
        };

        let record = match existing {
            Some(record) => {
                debug!(session_id = %record.id, anonymous = record.is_anonymous(), "Resumed session");
                self.is_new = false;
                record
            }
            None => {
                let tokens = self.manager.tokens();
                let config = self.manager.config();
                let record = SessionRecord::new(
                    tokens.generate_session_id(),
                    tokens.generate_token(),
                    tokens.generate_token(),
                    config.default_lan_id,
                    config.default_ttl,
                );
                store.create_session(&record).await?;
                info!(session_id = %record.id, store = store.store_type(), "Started new session");
                self.is_new = true;
                record
            }
        };

        self.adopt(record);
        Ok(())
    }

    /// Take `record` as the current state of the session.
    fn adopt(&mut self, record: SessionRecord) {
        self.state = if record.is_anonymous() {
            SessionState::Anonymous
        } else {
            SessionState::Authenticated
        };
        self.record = Some(record);
        self.changes = RecordChanges::default();
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `start` allocated a fresh id that the transport must hand out.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// The live record, for operations that need a started session.
    fn record_mut(&mut self, operation: &'static str) -> SessionResult<&mut SessionRecord> {
        match self.state {
            SessionState::Anonymous | SessionState::Authenticated => {}
            _ => return Err(self.invalid(operation)),
        }
        let state = self.state;
        self.record.as_mut().ok_or(SessionError::InvalidState { operation, state })
    }

    fn live_id(&self, operation: &'static str) -> SessionResult<String> {
        match (self.state, &self.record) {
            (SessionState::Anonymous | SessionState::Authenticated, Some(record)) => {
                Ok(record.id.clone())
            }
            _ => Err(self.invalid(operation)),
        }
    }

    fn mark_destroyed(&mut self) {
        self.sections.clear();
        self.state = SessionState::Destroyed;
    }

    // ========== Accessors ==========

    pub fn ses_id(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.id.as_str())
    }

    pub fn usr_id(&self) -> Option<i64> {
        self.record.as_ref().and_then(|r| r.usr_id)
    }

    pub fn pro_id(&self) -> Option<i64> {
        self.record.as_ref().and_then(|r| r.pro_id)
    }

    /// Preferred language; the configured default before `start`.
    pub fn lan_id(&self) -> i64 {
        self.record
            .as_ref()
            .map(|r| r.lan_id)
            .unwrap_or(self.manager.config().default_lan_id)
    }

    pub fn has_flash_message(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.has_flash_message)
    }

    /// True iff no user is logged in.
    pub fn is_anonymous(&self) -> bool {
        self.usr_id().is_none()
    }

    /// CSRF token, stable until the next login or logout.
    pub fn csrf_token(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.csrf_token.as_str())
    }

    pub fn session_token(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.session_token.as_str())
    }

    /// Check a token submitted with a state-changing request.
    pub fn verify_csrf_token(&self, presented: &str) -> bool {
        self.csrf_token()
            .is_some_and(|expected| tokens_match(expected, presented))
    }

    pub fn set_lan_id(&mut self, lan_id: i64) -> SessionResult<()> {
        self.record_mut("set_lan_id")?.lan_id = lan_id;
        self.changes.lan_id = Some(lan_id);
        Ok(())
    }

    pub fn set_has_flash_message(&mut self, has_flash_message: bool) -> SessionResult<()> {
        self.record_mut("set_has_flash_message")?.has_flash_message = has_flash_message;
        self.changes.has_flash_message = Some(has_flash_message);
        Ok(())
    }

    // ========== Authentication ==========

    /// Attach a user, rotating the session and CSRF tokens.
    ///
    /// Logging in on an authenticated session re-associates it with the new
    /// user.
    pub fn login(&mut self, usr_id: i64) -> SessionResult<()> {
        self.login_as(UserIdentity::new(usr_id))
    }

    pub fn login_as(&mut self, user: UserIdentity) -> SessionResult<()> {
        let identity = self.rotated_identity(Some(user.usr_id), user.pro_id);

        let record = self.record_mut("login")?;
        let previous = record.usr_id;
        identity.apply_to(record);

        info!(
            session_id = %record.id,
            usr_id = user.usr_id,
            previous_usr_id = ?previous,
            "User logged in"
        );
        self.changes.identity = Some(identity);
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Detach the user, rotating the session and CSRF tokens. The session id
    /// is kept.
    pub fn logout(&mut self) -> SessionResult<()> {
        let identity = self.rotated_identity(None, None);

        let record = self.record_mut("logout")?;
        let previous = record.usr_id;
        identity.apply_to(record);

        info!(session_id = %record.id, usr_id = ?previous, "User logged out");
        self.changes.identity = Some(identity);
        self.state = SessionState::Anonymous;
        Ok(())
    }

    fn rotated_identity(&self, usr_id: Option<i64>, pro_id: Option<i64>) -> IdentityChange {
        let tokens = self.manager.tokens();
        IdentityChange {
            usr_id,
            pro_id,
            session_token: tokens.generate_token(),
            csrf_token: tokens.generate_token(),
        }
    }

    // ========== Named sections ==========

    /// Acquire `name` in `mode` and return its working copy.
    ///
    /// The first call per request takes the section lock and loads the
    /// stored value (empty if the section does not exist). Later calls with
    /// the same mode return the same copy; a different mode is a
    /// [`SessionError::ModeConflict`].
    pub async fn get_named_section(
        &mut self,
        name: &str,
        mode: LockMode,
    ) -> SessionResult<&mut SectionValue> {
        let section = self.acquire(name, mode, "get_named_section").await?;
        Ok(section.value_mut())
    }

    /// Typed view of a named section.
    ///
    /// An empty section yields `T::default()`.
    pub async fn named_section<T>(&mut self, name: &str, mode: LockMode) -> SessionResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let value = self.get_named_section(name, mode).await?;
        if value.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_value(serde_json::Value::Object(value.clone()))
            .map_err(|e| SessionError::Deserialization(e.to_string()))
    }

    /// Replace the working copy of `name`; written by the next `save`.
    ///
    /// Sections not yet held are acquired in `Shared` mode.
    pub async fn store_named_section<V>(&mut self, name: &str, value: &V) -> SessionResult<()>
    where
        V: Serialize + ?Sized,
    {
        let value = to_section_value(value)?;
        self.held_or_shared(name, "store_named_section")
            .await?
            .replace(value);
        Ok(())
    }

    /// Replace `name` and write it immediately.
    ///
    /// Returns `false` if a first-come-first-served write lost to another
    /// request; the section is then dropped so that the next
    /// `get_named_section` reloads the winning value. Read-only sections
    /// are left untouched and report `true`.
    pub async fn save_named_section<V>(&mut self, name: &str, value: &V) -> SessionResult<bool>
    where
        V: Serialize + ?Sized,
    {
        let value = to_section_value(value)?;
        self.held_or_shared(name, "save_named_section")
            .await?
            .replace(value);
        self.flush_section(name).await
    }

    /// Delete `name` immediately.
    pub async fn del_named_section(&mut self, name: &str) -> SessionResult<bool> {
        self.held_or_shared(name, "del_named_section")
            .await?
            .replace(SectionValue::new());
        self.flush_section(name).await
    }

    /// Names of the sections held by this request.
    pub fn held_sections(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    async fn held_or_shared(
        &mut self,
        name: &str,
        operation: &'static str,
    ) -> SessionResult<&mut AcquiredSection> {
        let mode = self
            .sections
            .get(name)
            .map(AcquiredSection::mode)
            .unwrap_or(LockMode::Shared);
        self.acquire(name, mode, operation).await
    }

    async fn acquire(
        &mut self,
        name: &str,
        mode: LockMode,
        operation: &'static str,
    ) -> SessionResult<&mut AcquiredSection> {
        let ses_id = self.live_id(operation)?;

        match self.sections.get(name) {
            Some(held) if held.mode() != mode => {
                return Err(SessionError::ModeConflict {
                    section: name.to_string(),
                    held: held.mode(),
                    requested: mode,
                });
            }
            Some(_) => {}
            None => {
                let section = AcquiredSection::acquire(
                    self.manager.locks(),
                    self.manager.store(),
                    SectionKey::new(ses_id.as_str(), name),
                    mode,
                )
                .await?;
                self.sections.insert(name.to_string(), section);
            }
        }

        self.sections
            .get_mut(name)
            .ok_or_else(|| SessionError::NotFound(format!("{}/{}", ses_id, name)))
    }

    async fn flush_section(&mut self, name: &str) -> SessionResult<bool> {
        let outcome = match self.sections.get(name) {
            Some(section) => {
                section
                    .persist(self.manager.store(), self.manager.locks())
                    .await
            }
            None => return Ok(false),
        };

        match outcome {
            Ok(SectionOutcome::Written { version } | SectionOutcome::Deleted { version }) => {
                if let Some(section) = self.sections.get_mut(name) {
                    section.mark_saved(version);
                }
                Ok(true)
            }
            Ok(SectionOutcome::Conflict { .. }) => {
                self.sections.remove(name);
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(SessionError::NotFound(id)) => {
                warn!(session_id = %id, section = %name, "Session vanished while saving section");
                self.mark_destroyed();
                Err(SessionError::NotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    // ========== Persistence ==========

    /// Write back every modified section, refresh the session record, and
    /// release all section locks.
    ///
    /// Sections are independent: a conflict or store failure on one is
    /// reported in the [`SaveReport`] and does not stop the others. Locks are
    /// released whatever the outcome. If another request destroyed the
    /// session in the meantime, the session becomes `Destroyed` and
    /// [`SessionError::NotFound`] is returned.
    pub async fn save(&mut self) -> SessionResult<SaveReport> {
        match self.state {
            SessionState::Unstarted => return Ok(SaveReport::default()),
            SessionState::Destroyed => return Err(self.invalid("save")),
            SessionState::Anonymous | SessionState::Authenticated => {}
        }

        let sections = std::mem::take(&mut self.sections);
        let store = self.manager.store();
        let locks = self.manager.locks();

        let outcomes =
            join_all(sections.values().map(|section| section.persist(store, locks))).await;

        let mut report = SaveReport::default();
        for ((name, section), result) in sections.iter().zip(outcomes) {
            let key = SectionKey::new(self.ses_id().unwrap_or_default(), name.as_str());
            let outcome = SectionOutcome::from_result(&key, result);
            debug!(
                key = %key,
                mode = %section.mode(),
                base_version = section.version(),
                fields = section.value().len(),
                outcome = ?outcome,
                "Section saved"
            );
            report.insert(name.clone(), outcome);
        }

        let config = self.manager.config();
        let refreshed = match self.record.as_ref() {
            Some(record) => {
                store
                    .update_session(&record.id, &self.changes, config.default_ttl, config.max_ttl)
                    .await
            }
            None => Ok(None),
        };

        for section in sections.into_values() {
            if let Err(e) = locks.release(section.into_handle()).await {
                warn!(error = %e, "Failed to release section lock");
            }
        }

        let Some(record) = refreshed? else {
            let id = self.ses_id().unwrap_or_default().to_string();
            warn!(session_id = %id, "Session destroyed by another request before save");
            self.mark_destroyed();
            return Err(SessionError::NotFound(id));
        };
        self.adopt(record);

        if !report.is_success() {
            warn!(
                conflicts = ?report.conflicts(),
                failures = report.failures().len(),
                "Session saved with rejected sections"
            );
        }
        Ok(report)
    }

    /// Release every held section without writing anything.
    pub fn discard(&mut self) {
        if !self.sections.is_empty() {
            debug!(count = self.sections.len(), "Discarding held sections");
        }
        self.sections.clear();
    }

    // ========== Destruction ==========

    /// Destroy every session of the logged in user, this one included.
    ///
    /// On an anonymous session only this session is destroyed.
    pub async fn destroy_all_sessions(&mut self) -> SessionResult<usize> {
        let ses_id = self.live_id("destroy_all_sessions")?;
        let store = self.manager.store();

        let mut destroyed = match self.usr_id() {
            Some(usr_id) => store.delete_sessions_of_user(usr_id, Some(ses_id.as_str())).await?,
            None => 0,
        };
        if store.delete_session(&ses_id).await? {
            destroyed += 1;
        }

        info!(session_id = %ses_id, usr_id = ?self.usr_id(), destroyed, "Destroyed all sessions");
        self.mark_destroyed();
        Ok(destroyed)
    }

    /// Destroy every other session of the logged in user, keeping this one.
    pub async fn destroy_other_sessions(&mut self) -> SessionResult<usize> {
        let ses_id = self.live_id("destroy_other_sessions")?;
        let Some(usr_id) = self.usr_id() else {
            return Ok(0);
        };

        let destroyed = self
            .manager
            .store()
            .delete_sessions_of_user(usr_id, Some(ses_id.as_str()))
            .await?;
        info!(session_id = %ses_id, usr_id, destroyed, "Destroyed other sessions");
        Ok(destroyed)
    }

    /// Destroy every session of `usr_id`.
    ///
    /// If this session belongs to that user it is destroyed as well.
    pub async fn destroy_all_sessions_of_user(&mut self, usr_id: i64) -> SessionResult<usize> {
        if self.state == SessionState::Destroyed {
            return Err(self.invalid("destroy_all_sessions_of_user"));
        }

        let mut destroyed = self.manager.destroy_all_sessions_of_user(usr_id).await?;

        if self.usr_id() == Some(usr_id) {
            if let Some(id) = self.ses_id() {
                if self.manager.store().delete_session(id).await? {
                    destroyed += 1;
                }
            }
            self.mark_destroyed();
        }
        Ok(destroyed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ses_id", &self.ses_id())
            .field("state", &self.state)
            .field("usr_id", &self.usr_id())
            .field("is_new", &self.is_new)
            .field("held_sections", &self.held_sections())
            .finish()
    }
}
