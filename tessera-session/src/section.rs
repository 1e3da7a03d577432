//! Named sections acquired by a request, and the outcome of saving them.

use crate::error::{SessionError, SessionResult};
use crate::store::{Precondition, PutOutcome, SectionStore, SectionValue};
use std::collections::BTreeMap;
use tessera_lock::{LockError, LockHandle, LockManager, LockMode, SectionKey};
use tracing::{debug, error, warn};

/// A named section held by the current request.
///
/// Keeps the value as loaded next to the working copy, so saving can skip
/// sections the request never changed.
#[derive(Debug)]
pub(crate) struct AcquiredSection {
    value: SectionValue,
    original: SectionValue,
    version: u64,
    handle: LockHandle,
}

impl AcquiredSection {
    /// Take the section lock, then load the stored value.
    ///
    /// A section that was never written (or was deleted) loads as empty.
    pub(crate) async fn acquire(
        locks: &dyn LockManager,
        store: &dyn SectionStore,
        key: SectionKey,
        mode: LockMode,
    ) -> SessionResult<Self> {
        let handle = locks.acquire(&key, mode).await?;
        let entry = store
            .load_section(&key.session_id, &key.section)
            .await?
            .unwrap_or_default();

        debug!(
            key = %key,
            mode = %mode,
            version = entry.version,
            waited = ?handle.waited(),
            "Acquired named section"
        );

        let value = entry.value.unwrap_or_default();
        Ok(Self {
            original: value.clone(),
            value,
            version: entry.version,
            handle,
        })
    }

    pub fn value(&self) -> &SectionValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut SectionValue {
        &mut self.value
    }

    pub(crate) fn replace(&mut self, value: SectionValue) {
        self.value = value;
    }

    pub fn mode(&self) -> LockMode {
        self.handle.mode()
    }

    /// Stored version the working copy is based on.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_modified(&self) -> bool {
        self.value != self.original
    }

    pub(crate) fn mark_saved(&mut self, version: u64) {
        self.original = self.value.clone();
        self.version = version;
    }

    pub(crate) fn into_handle(self) -> LockHandle {
        self.handle
    }

    /// Write the working copy back if the mode allows it and it changed.
    ///
    /// First-come-first-served sections are written only if nobody else
    /// wrote them since they were loaded. Shared and exclusive sections are
    /// written only while their lock is still held.
    pub(crate) async fn persist(
        &self,
        store: &dyn SectionStore,
        locks: &dyn LockManager,
    ) -> SessionResult<SectionOutcome> {
        let key = self.handle.key();

        if !self.mode().is_writable() {
            return Ok(SectionOutcome::SkippedReadOnly);
        }
        if !self.is_modified() {
            return Ok(SectionOutcome::Unchanged);
        }

        if self.handle.is_blocking() && !locks.renew(&self.handle).await? {
            warn!(key = %key, held_for = ?self.handle.held_for(), "Section lock lapsed, write refused");
            return Err(LockError::NotHeld(key.to_string()).into());
        }

        let precondition = match self.mode() {
            LockMode::FirstComeFirstServed => Precondition::Version(self.version),
            _ => Precondition::None,
        };
        let value = (!self.value.is_empty()).then_some(&self.value);

        let outcome = store
            .put_section(&key.session_id, &key.section, value, precondition)
            .await?;

        Ok(match outcome {
            PutOutcome::Written { version } => SectionOutcome::Written { version },
            PutOutcome::Deleted { version } => SectionOutcome::Deleted { version },
            PutOutcome::Conflict { current } => {
                warn!(
                    key = %key,
                    base = self.version,
                    current,
                    "Section modified by another request, write rejected"
                );
                SectionOutcome::Conflict {
                    current_version: current,
                }
            }
        })
    }
}

/// What happened to one section during a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOutcome {
    Written { version: u64 },
    Deleted { version: u64 },
    /// Working copy equal to the loaded value; nothing written
    Unchanged,
    /// Acquired read-only; never persisted
    SkippedReadOnly,
    /// First-come-first-served write lost to an earlier writer
    Conflict { current_version: u64 },
    /// The store failed for this section
    Failed(String),
}

impl SectionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Conflict { .. } | Self::Failed(_))
    }

    pub(crate) fn from_result(key: &SectionKey, result: SessionResult<SectionOutcome>) -> Self {
        result.unwrap_or_else(|e| {
            error!(key = %key, error = %e, "Failed to persist section");
            SectionOutcome::Failed(e.to_string())
        })
    }
}

/// Per-section result of [`crate::Session::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    sections: BTreeMap<String, SectionOutcome>,
}

impl SaveReport {
    pub(crate) fn insert(&mut self, name: String, outcome: SectionOutcome) {
        self.sections.insert(name, outcome);
    }

    /// True iff no section conflicted or failed.
    pub fn is_success(&self) -> bool {
        self.sections.values().all(SectionOutcome::is_success)
    }

    pub fn outcome(&self, name: &str) -> Option<&SectionOutcome> {
        self.sections.get(name)
    }

    /// Sections whose first-come-first-served write was rejected.
    pub fn conflicts(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|(_, o)| matches!(o, SectionOutcome::Conflict { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Sections the store failed to write, with the reason.
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.sections
            .iter()
            .filter_map(|(name, o)| match o {
                SectionOutcome::Failed(reason) => Some((name.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SectionOutcome)> {
        self.sections.iter().map(|(name, o)| (name.as_str(), o))
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Convert a section value into the JSON object stored for it.
///
/// `null` becomes the empty section; anything but an object is rejected.
pub(crate) fn to_section_value<V: serde::Serialize + ?Sized>(
    value: &V,
) -> SessionResult<SectionValue> {
    match serde_json::to_value(value).map_err(|e| SessionError::Serialization(e.to_string()))? {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(SectionValue::new()),
        other => Err(SessionError::Serialization(format!(
            "section values must serialize to an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemorySectionStore;
    use crate::store::SessionRecord;
    use serde_json::json;
    use std::time::Duration;
    use tessera_lock::LocalLockManager;

    async fn setup() -> (LocalLockManager, MemorySectionStore) {
        let store = MemorySectionStore::new();
        store
            .create_session(&SessionRecord::new("s", "t", "c", 1, Duration::from_secs(60)))
            .await
            .unwrap();
        (LocalLockManager::default(), store)
    }

    #[tokio::test]
    async fn test_absent_section_is_empty() {
        let (locks, store) = setup().await;
        let section = AcquiredSection::acquire(
            &locks,
            &store,
            SectionKey::new("s", "cart"),
            LockMode::Shared,
        )
        .await
        .unwrap();

        assert!(section.value().is_empty());
        assert_eq!(section.version(), 0);
        assert!(!section.is_modified());
    }

    #[tokio::test]
    async fn test_unchanged_section_is_not_written() {
        let (locks, store) = setup().await;
        let section = AcquiredSection::acquire(
            &locks,
            &store,
            SectionKey::new("s", "cart"),
            LockMode::Exclusive,
        )
        .await
        .unwrap();

        assert_eq!(section.persist(&store, &locks).await.unwrap(), SectionOutcome::Unchanged);
        assert!(store.load_section("s", "cart").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_is_skipped() {
        let (locks, store) = setup().await;
        let mut section = AcquiredSection::acquire(
            &locks,
            &store,
            SectionKey::new("s", "prefs"),
            LockMode::ReadOnly,
        )
        .await
        .unwrap();
        section.value_mut().insert("theme".into(), json!("dark"));

        assert_eq!(
            section.persist(&store, &locks).await.unwrap(),
            SectionOutcome::SkippedReadOnly
        );
        assert!(store.load_section("s", "prefs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_come_first_served_conflict() {
        let (locks, store) = setup().await;
        let key = SectionKey::new("s", "form");
        let mut a = AcquiredSection::acquire(&locks, &store, key.clone(), LockMode::FirstComeFirstServed)
            .await
            .unwrap();
        let mut b = AcquiredSection::acquire(&locks, &store, key, LockMode::FirstComeFirstServed)
            .await
            .unwrap();

        a.value_mut().insert("who".into(), json!("a"));
        b.value_mut().insert("who".into(), json!("b"));

        assert_eq!(
            a.persist(&store, &locks).await.unwrap(),
            SectionOutcome::Written { version: 1 }
        );
        assert_eq!(
            b.persist(&store, &locks).await.unwrap(),
            SectionOutcome::Conflict { current_version: 1 }
        );

        let stored = store.load_section("s", "form").await.unwrap().unwrap();
        assert_eq!(stored.value.unwrap()["who"], json!("a"));
    }

    /// Local locks whose holds always count as lapsed.
    struct LapsedLocks(LocalLockManager);

    #[async_trait::async_trait]
    impl LockManager for LapsedLocks {
        async fn acquire_timeout(
            &self,
            key: &SectionKey,
            mode: LockMode,
            timeout: Duration,
        ) -> tessera_lock::LockResult<LockHandle> {
            self.0.acquire_timeout(key, mode, timeout).await
        }

        async fn release(&self, handle: LockHandle) -> tessera_lock::LockResult<()> {
            self.0.release(handle).await
        }

        async fn renew(&self, handle: &LockHandle) -> tessera_lock::LockResult<bool> {
            Ok(!handle.is_blocking())
        }

        fn default_timeout(&self) -> Duration {
            self.0.default_timeout()
        }

        fn backend(&self) -> &'static str {
            "lapsed"
        }
    }

    #[tokio::test]
    async fn test_lapsed_lock_refuses_write() {
        let (locks, store) = setup().await;
        let locks = LapsedLocks(locks);
        let key = SectionKey::new("s", "cart");
        let mut section = AcquiredSection::acquire(&locks, &store, key.clone(), LockMode::Exclusive)
            .await
            .unwrap();
        section.value_mut().insert("n".into(), json!(1));

        let err = section.persist(&store, &locks).await.unwrap_err();
        assert!(matches!(err, SessionError::Lock(LockError::NotHeld(_))));
        assert!(matches!(
            SectionOutcome::from_result(&key, Err(err)),
            SectionOutcome::Failed(_)
        ));
        assert!(store.load_section("s", "cart").await.unwrap().is_none());

        // Lock-free modes have nothing to lapse
        let mut form = AcquiredSection::acquire(
            &locks,
            &store,
            SectionKey::new("s", "form"),
            LockMode::FirstComeFirstServed,
        )
        .await
        .unwrap();
        form.value_mut().insert("n".into(), json!(1));
        assert_eq!(
            form.persist(&store, &locks).await.unwrap(),
            SectionOutcome::Written { version: 1 }
        );
    }

    #[test]
    fn test_report() {
        let mut report = SaveReport::default();
        report.insert("a".into(), SectionOutcome::Written { version: 1 });
        report.insert("b".into(), SectionOutcome::SkippedReadOnly);
        assert!(report.is_success());

        report.insert("c".into(), SectionOutcome::Conflict { current_version: 3 });
        report.insert("d".into(), SectionOutcome::Failed("down".into()));
        assert!(!report.is_success());
        assert_eq!(report.conflicts(), vec!["c"]);
        assert_eq!(report.failures(), vec![("d", "down")]);
        assert_eq!(report.len(), 4);
    }

    #[test]
    fn test_to_section_value() {
        assert_eq!(to_section_value(&json!({"a": 1})).unwrap().len(), 1);
        assert!(to_section_value(&json!(null)).unwrap().is_empty());
        assert!(matches!(
            to_section_value(&json!([1, 2])),
            Err(SessionError::Serialization(_))
        ));
    }
}
