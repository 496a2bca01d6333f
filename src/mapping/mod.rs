pub mod fallback;
pub mod local;
pub mod supabase;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{CrosspostError, Result};
use crate::event::SourceKey;

pub use fallback::{FallbackEntry, FallbackLog};

// ---------------------------------------------------------------------------
// PostMapping
// ---------------------------------------------------------------------------

/// Source message → destination post correspondence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMapping {
    pub source: SourceKey,
    pub target_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub edit_count: u32,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostMapping {
    pub fn new(source: SourceKey, target_id: i64, owner_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            source,
            target_id,
            owner_id,
            edit_count: 0,
            is_edited: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn from_fallback(entry: FallbackEntry) -> Self {
        Self::new(entry.source, entry.target_id, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(PostMapping),
    NotFound,
}

impl Lookup {
    pub fn target_id(&self) -> Option<i64> {
        match self {
            Self::Found(m) => Some(m.target_id),
            Self::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTier {
    Primary,
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub replayed: usize,
    pub remaining: usize,
}

// ---------------------------------------------------------------------------
// MappingBackend
// ---------------------------------------------------------------------------

/// A durable primary store for post mappings.
#[async_trait]
pub trait MappingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Reachability check, run once when the store is opened.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, source: SourceKey) -> Result<Option<PostMapping>>;

    /// Insert or update the mapping for `source`. Never creates a second
    /// record for the same key.
    async fn upsert(
        &self,
        source: SourceKey,
        target_id: i64,
        owner_id: Option<&str>,
    ) -> Result<PostMapping>;

    /// Bump the edit count and set the edited flag. `None` when unknown.
    async fn increment_edit(&self, source: SourceKey) -> Result<Option<PostMapping>>;
}

// ---------------------------------------------------------------------------
// MappingStore
// ---------------------------------------------------------------------------

/// Two-tier mapping store: a primary backend, or the append-only fallback
/// log when the primary was unreachable at startup.
pub struct MappingStore {
    primary: Option<Arc<dyn MappingBackend>>,
    log: FallbackLog,
    /// Serializes read-modify-write per source key.
    key_locks: Mutex<HashMap<SourceKey, Arc<Mutex<()>>>>,
}

impl MappingStore {
    /// Ping the primary and pick the tier for the lifetime of the store.
    pub async fn open(primary: Arc<dyn MappingBackend>, log: FallbackLog) -> Self {
        match primary.ping().await {
            Ok(()) => {
                info!("Mapping store: {} (fallback log {})", primary.name(), log.path().display());
                Self::with_primary(primary, log)
            }
            Err(e) => {
                warn!(
                    "Mapping store {} unavailable, using fallback log {}: {e}",
                    primary.name(),
                    log.path().display()
                );
                Self::degraded(log)
            }
        }
    }

    pub fn with_primary(primary: Arc<dyn MappingBackend>, log: FallbackLog) -> Self {
        Self {
            primary: Some(primary),
            log,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn degraded(log: FallbackLog) -> Self {
        Self {
            primary: None,
            log,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn tier(&self) -> StoreTier {
        if self.primary.is_some() {
            StoreTier::Primary
        } else {
            StoreTier::Degraded
        }
    }

    pub fn backend_name(&self) -> &str {
        self.primary
            .as_ref()
            .map_or("fallback-log", |p| p.name())
    }

    async fn lock_key(&self, source: SourceKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(source).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, source: SourceKey) -> Result<Lookup> {
        if let Some(primary) = &self.primary {
            match primary.get(source).await {
                Ok(Some(mapping)) => return Ok(Lookup::Found(mapping)),
                // Writes that failed over to the log are not in the primary yet.
                Ok(None) => {}
                Err(e) => warn!(%source, error = %e, "primary mapping read failed, scanning fallback log"),
            }
        }

        Ok(match self.log.find(source).await? {
            Some(target_id) => {
                Lookup::Found(PostMapping::from_fallback(FallbackEntry::new(source, target_id)))
            }
            None => Lookup::NotFound,
        })
    }

    /// Record that `source` was published as `target_id`. Idempotent per key.
    pub async fn upsert(&self, source: SourceKey, target_id: i64, owner_id: Option<&str>) -> Result<()> {
        let _guard = self.lock_key(source).await;
        let entry = FallbackEntry::new(source, target_id);

        let Some(primary) = &self.primary else {
            if !self.log.append_if_absent(entry).await? {
                debug!(%source, target_id, "mapping already in fallback log");
            }
            return Ok(());
        };

        match primary.upsert(source, target_id, owner_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(%source, target_id, error = %e, "primary mapping write failed, appending to fallback log");
                self.log.append_if_absent(entry).await.map(|_| ())
            }
        }
    }

    pub async fn increment_edit(&self, source: SourceKey) -> Result<()> {
        let _guard = self.lock_key(source).await;

        let Some(primary) = &self.primary else {
            debug!(%source, "fallback log keeps no edit metadata");
            return Ok(());
        };

        match primary.increment_edit(source).await? {
            Some(mapping) => {
                debug!(%source, edit_count = mapping.edit_count, "edit recorded");
                Ok(())
            }
            None => {
                // Mapping lives only in the fallback log until reconciled.
                debug!(%source, "no primary record to mark edited");
                Ok(())
            }
        }
    }

    /// Current log records not yet written to the primary store.
    pub async fn pending(&self) -> Result<Vec<FallbackEntry>> {
        let entries = self.log.latest().await?;
        let Some(primary) = &self.primary else {
            return Ok(entries);
        };

        let mut pending = Vec::new();
        for entry in entries {
            match primary.get(entry.source).await {
                Ok(Some(m)) if m.target_id == entry.target_id => {}
                _ => pending.push(entry),
            }
        }
        Ok(pending)
    }

    /// Replay fallback log entries into the primary store. Entries that are
    /// written (or already present) are dropped from the log.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let Some(primary) = &self.primary else {
            return Err(CrosspostError::Mapping(
                "primary store unavailable, nothing to reconcile into".into(),
            ));
        };

        // Superseded lines go once their source's current target is written.
        let mut settled: HashSet<SourceKey> = HashSet::new();
        let mut replayed = 0;
        for entry in self.log.latest().await? {
            let _guard = self.lock_key(entry.source).await;

            let present = matches!(
                primary.get(entry.source).await,
                Ok(Some(ref m)) if m.target_id == entry.target_id
            );
            if present {
                settled.insert(entry.source);
                continue;
            }

            match primary.upsert(entry.source, entry.target_id, None).await {
                Ok(_) => {
                    replayed += 1;
                    settled.insert(entry.source);
                }
                Err(e) => warn!(source = %entry.source, error = %e, "reconcile: write still failing"),
            }
        }

        let remaining = self.log.retain(|e| !settled.contains(&e.source)).await?;
        info!(replayed, remaining, "fallback log reconciled");
        Ok(ReconcileReport { replayed, remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingBackend, MemoryMappings};

    fn key(m: i32) -> SourceKey {
        SourceKey::new(-1001234, m)
    }

    fn log_in(dir: &tempfile::TempDir) -> FallbackLog {
        FallbackLog::new(dir.path().join("data.txt"))
    }

    #[tokio::test]
    async fn test_round_trip_in_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(Arc::new(MemoryMappings::default()), log_in(&tmp)).await;
        assert_eq!(store.tier(), StoreTier::Primary);

        store.upsert(key(1), 500, Some("owner")).await.unwrap();
        assert_eq!(store.get(key(1)).await.unwrap().target_id(), Some(500));
        assert_eq!(store.get(key(2)).await.unwrap(), Lookup::NotFound);
    }

    #[tokio::test]
    async fn test_upsert_updates_instead_of_duplicating() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryMappings::default());
        let store = MappingStore::open(backend.clone(), log_in(&tmp)).await;

        store.upsert(key(1), 500, None).await.unwrap();
        store.upsert(key(1), 501, None).await.unwrap();

        assert_eq!(backend.len().await, 1);
        assert_eq!(store.get(key(1)).await.unwrap().target_id(), Some(501));
    }

    #[tokio::test]
    async fn test_concurrent_edit_increments_are_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryMappings::default());
        let store = Arc::new(MappingStore::open(backend.clone(), log_in(&tmp)).await);
        store.upsert(key(1), 500, None).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_edit(key(1)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let Lookup::Found(mapping) = store.get(key(1)).await.unwrap() else {
            panic!("mapping missing");
        };
        assert_eq!(mapping.edit_count, 20);
        assert!(mapping.is_edited);
    }

    #[tokio::test]
    async fn test_unreachable_primary_selects_degraded_tier() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(Arc::new(FailingBackend::unreachable()), log_in(&tmp)).await;
        assert_eq!(store.tier(), StoreTier::Degraded);

        store.upsert(key(7), 70, None).await.unwrap();
        store.upsert(key(7), 70, None).await.unwrap();
        assert_eq!(store.get(key(7)).await.unwrap().target_id(), Some(70));

        let text = std::fs::read_to_string(tmp.path().join("data.txt")).unwrap();
        assert_eq!(text, "-1001234/7:70\n");

        // No edit metadata in the log, but the call still succeeds.
        store.increment_edit(key(7)).await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_upsert_retargets_instead_of_keeping_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::degraded(log_in(&tmp));

        store.upsert(key(4), 10, None).await.unwrap();
        store.upsert(key(4), 11, None).await.unwrap();

        assert_eq!(store.get(key(4)).await.unwrap().target_id(), Some(11));
        assert_eq!(store.pending().await.unwrap(), vec![FallbackEntry::new(key(4), 11)]);
    }

    #[tokio::test]
    async fn test_reconcile_writes_current_target_and_drops_superseded_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(&tmp);
        log.append(FallbackEntry::new(key(5), 50)).await.unwrap();
        log.append(FallbackEntry::new(key(5), 51)).await.unwrap();

        let backend = Arc::new(MemoryMappings::default());
        let store = MappingStore::open(backend.clone(), log).await;
        let report = store.reconcile().await.unwrap();

        assert_eq!(report, ReconcileReport { replayed: 1, remaining: 0 });
        assert_eq!(backend.get_record(key(5)).await.unwrap().target_id, 51);
    }

    #[tokio::test]
    async fn test_failed_primary_write_lands_in_log_and_is_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(Arc::new(FailingBackend::writes_fail()), log_in(&tmp)).await;
        assert_eq!(store.tier(), StoreTier::Primary);

        store.upsert(key(3), 30, None).await.unwrap();
        assert_eq!(store.get(key(3)).await.unwrap().target_id(), Some(30));
        assert_eq!(store.pending().await.unwrap(), vec![FallbackEntry::new(key(3), 30)]);
    }

    #[tokio::test]
    async fn test_reconcile_replays_log_into_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_in(&tmp);
        log.append(FallbackEntry::new(key(1), 10)).await.unwrap();
        log.append(FallbackEntry::new(key(2), 20)).await.unwrap();
        log.append(FallbackEntry::new(key(1), 10)).await.unwrap();

        let backend = Arc::new(MemoryMappings::default());
        let store = MappingStore::open(backend.clone(), log).await;
        assert_eq!(store.pending().await.unwrap().len(), 2);

        let report = store.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport { replayed: 2, remaining: 0 });
        assert_eq!(backend.len().await, 2);
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_requires_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::degraded(log_in(&tmp));
        assert!(matches!(store.reconcile().await, Err(CrosspostError::Mapping(_))));
    }
}
