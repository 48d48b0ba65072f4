//! Durable execution state for suspend/resume.
//!
//! [`ExecutionState`] is owned by the scheduler and persisted as JSON
//! through [`CheckpointStore`]. A checkpoint that cannot be parsed is
//! treated as absent: the next run starts from a fresh enumeration.
//! Permanently failed items are kept separately in a [`FailureLedger`]
//! so they survive the checkpoint being cleared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FetchErrorKind, StoreError};
use crate::models::WorkItem;
use crate::store::ObjectStore;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: u32,
    pub pending: Vec<WorkItem>,
    pub completed: BTreeSet<WorkItem>,
    /// Item-level failure counts keyed by [`WorkItem::key`].
    pub failed_attempts: BTreeMap<String, u32>,
    pub permanently_failed: BTreeSet<WorkItem>,
    /// Keys of items already granted their one re-fetch after quarantine.
    #[serde(default)]
    pub refetched: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub progress_fraction: f64,
    /// How many runs have worked on this backlog.
    #[serde(default)]
    pub invocations: u32,
}

impl ExecutionState {
    pub fn fresh(pending: Vec<WorkItem>, started_at: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            pending,
            completed: BTreeSet::new(),
            failed_attempts: BTreeMap::new(),
            permanently_failed: BTreeSet::new(),
            refetched: BTreeSet::new(),
            started_at,
            last_checkpoint_at: None,
            progress_fraction: 0.0,
            invocations: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.pending.len() + self.completed.len() + self.permanently_failed.len()
    }

    pub fn refresh_progress(&mut self) {
        let total = self.total();
        self.progress_fraction = if total == 0 {
            1.0
        } else {
            (self.completed.len() + self.permanently_failed.len()) as f64 / total as f64
        };
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Reads and writes the checkpoint object.
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load the saved state. Missing or malformed data yields `None`; only
    /// a failing store is an error.
    pub async fn load(&self) -> Result<Option<ExecutionState>, StoreError> {
        let bytes = match self.store.read_bytes(&self.path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<ExecutionState>(&bytes) {
            Ok(state) if state.version == CHECKPOINT_VERSION => {
                debug!(pending = state.pending.len(), "checkpoint loaded");
                Ok(Some(state))
            }
            Ok(state) => {
                warn!(
                    path = %self.path,
                    version = state.version,
                    "ignoring checkpoint with unsupported version"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "ignoring malformed checkpoint");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, state: &ExecutionState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::serde(self.path.clone(), e))?;
        self.store.write_bytes(&self.path, &json).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(&self.path).await
    }
}

/// One permanently failed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: WorkItem,
    pub error_kind: Option<FetchErrorKind>,
    pub message: String,
    pub failures: u32,
    pub failed_at: DateTime<Utc>,
}

/// Persistent list of items given up on, keyed by [`WorkItem::key`].
pub struct FailureLedger {
    store: Arc<dyn ObjectStore>,
    path: String,
    entries: BTreeMap<String, FailedItem>,
}

impl FailureLedger {
    pub async fn open(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match store.read_bytes(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "ignoring malformed failure ledger");
                BTreeMap::new()
            }),
            Err(StoreError::NotFound(_)) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            store,
            path,
            entries,
        })
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FailedItem> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, entry: FailedItem) {
        self.entries.insert(entry.item.key(), entry);
    }

    /// Forget an item that has since succeeded. Returns whether it was
    /// listed.
    pub fn resolve(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| StoreError::serde(self.path.clone(), e))?;
        self.store.write_bytes(&self.path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PeriodKey, PeriodKind, SourceParameters};
    use crate::store::memory::MemoryObjectStore;

    fn item(i: u32) -> WorkItem {
        WorkItem {
            data_type: "notifiable_weekly".into(),
            period_kind: PeriodKind::Weekly,
            period_key: PeriodKey::new(2024, i),
            source: SourceParameters {
                report_type: "20".into(),
                endpoint: "dlwzensu.do".into(),
                pref_code: "13".into(),
                hc_code: "00".into(),
                epid_code: String::new(),
                total_mode: "0".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let mem = Arc::new(MemoryObjectStore::new());
        let ckpt = CheckpointStore::new(mem, "state/checkpoint.json");

        let mut state = ExecutionState::fresh((1..=5).map(item).collect(), Utc::now());
        state.completed.insert(item(10));
        state.completed.insert(item(11));
        state.failed_attempts.insert(item(1).key(), 2);
        state.last_checkpoint_at = Some(Utc::now());
        state.refresh_progress();

        ckpt.save(&state).await.unwrap();
        let loaded = ckpt.load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.pending.len(), 5);
        assert_eq!(loaded.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let mem = Arc::new(MemoryObjectStore::new());
        let ckpt = CheckpointStore::new(mem, "state/checkpoint.json");
        assert!(ckpt.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_none() {
        let mem = Arc::new(MemoryObjectStore::new());
        mem.write_bytes("state/checkpoint.json", b"{\"version\":1,\"pend")
            .await
            .unwrap();
        let ckpt = CheckpointStore::new(mem, "state/checkpoint.json");
        assert!(ckpt.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_version_is_none() {
        let mem = Arc::new(MemoryObjectStore::new());
        let ckpt = CheckpointStore::new(mem, "state/checkpoint.json");
        let mut state = ExecutionState::fresh(vec![item(1)], Utc::now());
        state.version = 99;
        ckpt.save(&state).await.unwrap();
        assert!(ckpt.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_checkpoint() {
        let mem = Arc::new(MemoryObjectStore::new());
        let ckpt = CheckpointStore::new(mem.clone(), "state/checkpoint.json");
        ckpt.save(&ExecutionState::fresh(vec![], Utc::now())).await.unwrap();
        ckpt.clear().await.unwrap();
        assert!(!mem.exists("state/checkpoint.json").await.unwrap());
    }

    #[test]
    fn test_progress_fraction() {
        let mut state = ExecutionState::fresh(vec![item(1), item(2), item(3)], Utc::now());
        state.completed.insert(item(4));
        state.refresh_progress();
        assert!((state.progress_fraction - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_ledger_persists() {
        let mem = Arc::new(MemoryObjectStore::new());
        let mut ledger = FailureLedger::open(mem.clone(), "state/failed_items.json")
            .await
            .unwrap();
        ledger.record(FailedItem {
            item: item(3),
            error_kind: Some(FetchErrorKind::PermanentClient),
            message: "HTTP 400".into(),
            failures: 3,
            failed_at: Utc::now(),
        });
        ledger.save().await.unwrap();

        let mut reopened = FailureLedger::open(mem, "state/failed_items.json")
            .await
            .unwrap();
        assert!(reopened.keys().contains(&item(3).key()));
        assert!(reopened.resolve(&item(3).key()));
        assert!(reopened.is_empty());
    }
}
