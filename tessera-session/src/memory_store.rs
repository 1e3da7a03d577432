//! In-memory section store
//!
//! Uses DashMap for thread-safe concurrent access. Each session's record and
//! sections live in one slot, so a section write holds only that session's
//! shard. Suitable for single-instance deployments or testing.

use crate::error::{SessionError, SessionResult};
use crate::store::{
    Precondition, PutOutcome, RecordChanges, SectionEntry, SectionStore, SectionValue,
    SessionRecord,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

struct SessionSlot {
    record: SessionRecord,
    sections: HashMap<String, SectionEntry>,
}

/// In-memory section store
pub struct MemorySectionStore {
    sessions: DashMap<String, SessionSlot>,
    /// user id -> session ids
    users: DashMap<i64, HashSet<String>>,
}

impl MemorySectionStore {
    pub fn new() -> Self {
        debug!("Creating new in-memory section store");
        Self {
            sessions: DashMap::new(),
            users: DashMap::new(),
        }
    }

    fn index(&self, usr_id: Option<i64>, session_id: &str) {
        if let Some(usr_id) = usr_id {
            self.users
                .entry(usr_id)
                .or_default()
                .insert(session_id.to_string());
        }
    }

    fn unindex(&self, usr_id: Option<i64>, session_id: &str) {
        if let Some(usr_id) = usr_id {
            if let Some(mut ids) = self.users.get_mut(&usr_id) {
                ids.remove(session_id);
            }
            self.users.remove_if(&usr_id, |_, ids| ids.is_empty());
        }
    }

    fn remove_slot(&self, session_id: &str) -> Option<SessionSlot> {
        let (_, slot) = self.sessions.remove(session_id)?;
        self.unindex(slot.record.usr_id, session_id);
        Some(slot)
    }

    fn remove_if_expired(&self, session_id: &str) {
        if let Some((_, slot)) = self
            .sessions
            .remove_if(session_id, |_, slot| slot.record.is_expired())
        {
            debug!(session_id = %session_id, "Removed expired session");
            self.unindex(slot.record.usr_id, session_id);
        }
    }
}

impl Default for MemorySectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SectionStore for MemorySectionStore {
    async fn create_session(&self, record: &SessionRecord) -> SessionResult<()> {
        self.sessions.insert(
            record.id.clone(),
            SessionSlot {
                record: record.clone(),
                sections: HashMap::new(),
            },
        );
        self.index(record.usr_id, &record.id);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> SessionResult<Option<SessionRecord>> {
        let record = self
            .sessions
            .get(session_id)
            .map(|slot| slot.record.clone());

        match record {
            Some(record) if record.is_expired() => {
                self.remove_if_expired(session_id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn update_session(
        &self,
        session_id: &str,
        changes: &RecordChanges,
        ttl: Duration,
        max_lifetime: Duration,
    ) -> SessionResult<Option<SessionRecord>> {
        let Some(mut slot) = self.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if slot.record.is_expired() {
            drop(slot);
            self.remove_if_expired(session_id);
            return Ok(None);
        }

        let previous_usr = slot.record.usr_id;
        slot.record.refresh(changes, ttl, max_lifetime);

        // Reindexed under the slot guard; delete_session unindexes only after
        // it has removed the slot.
        if previous_usr != slot.record.usr_id {
            self.unindex(previous_usr, session_id);
            self.index(slot.record.usr_id, session_id);
        }
        Ok(Some(slot.record.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> SessionResult<bool> {
        Ok(self.remove_slot(session_id).is_some())
    }

    async fn sessions_of_user(&self, usr_id: i64) -> SessionResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .users
            .get(&usr_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn load_section(
        &self,
        session_id: &str,
        name: &str,
    ) -> SessionResult<Option<SectionEntry>> {
        Ok(self.sessions.get(session_id).and_then(|slot| {
            if slot.record.is_expired() {
                None
            } else {
                slot.sections.get(name).cloned()
            }
        }))
    }

    async fn put_section(
        &self,
        session_id: &str,
        name: &str,
        value: Option<&SectionValue>,
        precondition: Precondition,
    ) -> SessionResult<PutOutcome> {
        let mut slot = self
            .sessions
            .get_mut(session_id)
            .filter(|slot| !slot.record.is_expired())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let current = slot.sections.get(name).map(|e| e.version).unwrap_or(0);
        if let Precondition::Version(expected) = precondition {
            if expected != current {
                trace!(session_id = %session_id, section = %name, expected, current, "Section version conflict");
                return Ok(PutOutcome::Conflict { current });
            }
        }

        let version = current + 1;
        match value.filter(|v| !v.is_empty()) {
            Some(value) => {
                slot.sections.insert(
                    name.to_string(),
                    SectionEntry {
                        value: Some(value.clone()),
                        version,
                    },
                );
                trace!(session_id = %session_id, section = %name, version, "Section written");
                Ok(PutOutcome::Written { version })
            }
            None => {
                slot.sections.insert(
                    name.to_string(),
                    SectionEntry {
                        value: None,
                        version,
                    },
                );
                trace!(session_id = %session_id, section = %name, version, "Section deleted");
                Ok(PutOutcome::Deleted { version })
            }
        }
    }

    async fn count(&self) -> SessionResult<usize> {
        Ok(self
            .sessions
            .iter()
            .filter(|slot| !slot.record.is_expired())
            .count())
    }

    async fn cleanup_expired(&self) -> SessionResult<usize> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|slot| slot.record.is_expired())
            .map(|slot| slot.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in expired {
            if self
                .sessions
                .remove_if(&session_id, |_, slot| slot.record.is_expired())
                .map(|(_, slot)| self.unindex(slot.record.usr_id, &session_id))
                .is_some()
            {
                removed += 1;
            }
        }

        debug!(removed, "Cleaned up expired sessions");
        Ok(removed)
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
