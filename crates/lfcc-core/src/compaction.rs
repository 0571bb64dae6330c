//! Update-log storage contract and snapshot compaction.
//!
//! A document is persisted as its latest snapshot plus the updates appended
//! since. Compaction folds the log into a new snapshot and prunes all but the
//! most recent updates, which stay available for catch-up.

use crate::crdt::{CrdtError, CrdtRuntime, FrontierTag, LoroRuntime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Materialized frontier {actual} does not match stored frontier {expected}")]
    FrontierMismatch {
        expected: FrontierTag,
        actual: FrontierTag,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    pub update_threshold: usize,
    pub max_snapshot_age_minutes: u64,
    pub keep_recent_updates: usize,
    /// Cadence of the per-document timer.
    pub time_threshold_minutes: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            update_threshold: 100,
            max_snapshot_age_minutes: 60,
            keep_recent_updates: 10,
            time_threshold_minutes: 5,
        }
    }
}

/// One applied update, as persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Server-assigned, strictly increasing per document.
    pub seq: u64,
    pub data: Vec<u8>,
    /// Server frontier after applying this update.
    pub frontier_tag: FrontierTag,
    /// Frontier the sender produced the update against.
    pub parent_frontier_tag: FrontierTag,
    pub client_id: String,
    pub created_at: u64,
}

/// Full materialization of a document at one point in its update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub doc_id: String,
    pub data: Vec<u8>,
    pub frontier_tag: FrontierTag,
    /// Incremented on every compaction of this document.
    pub seq: u64,
    pub created_at: u64,
    pub size_bytes: usize,
    /// Highest update seq folded into this snapshot.
    pub through_update_seq: u64,
}

/// Persistence contract for snapshots and update logs.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<DocSnapshot>>;

    /// Stored updates in seq order.
    async fn get_updates(&self, doc_id: &str) -> Result<Vec<UpdateRecord>>;

    async fn append_update(&self, doc_id: &str, record: UpdateRecord) -> Result<()>;

    /// Persist a snapshot. Must be all-or-nothing.
    async fn save_snapshot(&self, snapshot: DocSnapshot) -> Result<()>;

    /// Delete updates with `seq <= through_seq`. Returns how many were removed.
    async fn delete_updates(&self, doc_id: &str, through_seq: u64) -> Result<usize>;

    /// Frontier of the newest update, else of the latest snapshot.
    async fn get_current_frontier_tag(&self, doc_id: &str) -> Result<Option<FrontierTag>> {
        if let Some(last) = self.get_updates(doc_id).await?.pop() {
            return Ok(Some(last.frontier_tag));
        }
        Ok(self
            .get_latest_snapshot(doc_id)
            .await?
            .map(|s| s.frontier_tag))
    }

    async fn list_docs(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
struct MemoryDoc {
    snapshot: Option<DocSnapshot>,
    updates: Vec<UpdateRecord>,
}

/// In-memory [`UpdateStore`] for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, MemoryDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_docs<T>(&self, f: impl FnOnce(&mut HashMap<String, MemoryDoc>) -> T) -> T {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut docs)
    }
}

#[async_trait]
impl UpdateStore for MemoryStore {
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<DocSnapshot>> {
        Ok(self.with_docs(|docs| docs.get(doc_id).and_then(|d| d.snapshot.clone())))
    }

    async fn get_updates(&self, doc_id: &str) -> Result<Vec<UpdateRecord>> {
        Ok(self.with_docs(|docs| {
            docs.get(doc_id)
                .map(|d| d.updates.clone())
                .unwrap_or_default()
        }))
    }

    async fn append_update(&self, doc_id: &str, record: UpdateRecord) -> Result<()> {
        self.with_docs(|docs| {
            docs.entry(doc_id.to_string())
                .or_default()
                .updates
                .push(record)
        });
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: DocSnapshot) -> Result<()> {
        let doc_id = snapshot.doc_id.clone();
        self.with_docs(|docs| docs.entry(doc_id).or_default().snapshot = Some(snapshot));
        Ok(())
    }

    async fn delete_updates(&self, doc_id: &str, through_seq: u64) -> Result<usize> {
        Ok(self.with_docs(|docs| {
            let Some(doc) = docs.get_mut(doc_id) else {
                return 0;
            };
            let before = doc.updates.len();
            doc.updates.retain(|u| u.seq > through_seq);
            before - doc.updates.len()
        }))
    }

    async fn list_docs(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.with_docs(|docs| docs.keys().cloned().collect());
        ids.sort();
        Ok(ids)
    }
}

/// Whether a document's log should be folded into a new snapshot.
///
/// Only updates newer than the snapshot count as pending; updates kept
/// around after a compaction are already folded in. Without a snapshot, age
/// is measured from the oldest pending update.
pub fn should_compact(
    policy: &CompactionPolicy,
    updates: &[UpdateRecord],
    last_snapshot: Option<&DocSnapshot>,
    now: u64,
) -> bool {
    let folded = last_snapshot.map_or(0, |s| s.through_update_seq);
    let pending: Vec<&UpdateRecord> = updates.iter().filter(|u| u.seq > folded).collect();
    let Some(oldest) = pending.first() else {
        return false;
    };
    if pending.len() >= policy.update_threshold {
        return true;
    }
    let reference = match last_snapshot {
        Some(snapshot) => snapshot.created_at,
        None => oldest.created_at,
    };
    let max_age_ms = policy.max_snapshot_age_minutes * 60_000;
    now.saturating_sub(reference) > max_age_ms
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub doc_id: String,
    pub snapshot_seq: u64,
    pub frontier_tag: FrontierTag,
    pub pruned: usize,
    pub kept: usize,
    pub size_bytes: usize,
}

/// Rebuild a runtime from a snapshot and updates.
pub fn materialize(snapshot: Option<&DocSnapshot>, updates: &[UpdateRecord]) -> std::result::Result<LoroRuntime, CrdtError> {
    let mut runtime = LoroRuntime::new();
    if let Some(snapshot) = snapshot {
        runtime.import(&snapshot.data)?;
    }
    for update in updates {
        runtime.import(&update.data)?;
    }
    Ok(runtime)
}

/// Fold the update log into a new snapshot, then prune old updates.
///
/// The snapshot is written before anything is pruned. Returns `None` when the
/// document has no pending updates.
pub async fn run_compaction(
    store: &dyn UpdateStore,
    doc_id: &str,
    policy: &CompactionPolicy,
    now: u64,
) -> std::result::Result<Option<CompactionReport>, CompactionError> {
    let previous = store.get_latest_snapshot(doc_id).await?;
    let updates = store.get_updates(doc_id).await?;
    let Some(last) = updates.last() else {
        return Ok(None);
    };
    // Read from the fetched log; appends racing this pass land in the next one.
    let expected = last.frontier_tag.clone();

    let runtime = materialize(previous.as_ref(), &updates)?;
    let actual = runtime.frontier_tag();
    if actual != expected {
        return Err(CompactionError::FrontierMismatch { expected, actual });
    }

    let data = runtime.export_snapshot()?;
    let snapshot = DocSnapshot {
        doc_id: doc_id.to_string(),
        size_bytes: data.len(),
        data,
        frontier_tag: actual.clone(),
        seq: previous.as_ref().map_or(1, |s| s.seq + 1),
        created_at: now,
        through_update_seq: last.seq,
    };
    let snapshot_seq = snapshot.seq;
    let size_bytes = snapshot.size_bytes;
    store.save_snapshot(snapshot).await?;

    let prune_count = updates.len().saturating_sub(policy.keep_recent_updates);
    let pruned = if prune_count > 0 {
        store
            .delete_updates(doc_id, updates[prune_count - 1].seq)
            .await?
    } else {
        0
    };
    let kept = updates.len() - prune_count;

    info!(
        "Compacted {}: snapshot #{} ({} bytes), pruned {} updates, kept {}",
        doc_id, snapshot_seq, size_bytes, pruned, kept
    );
    Ok(Some(CompactionReport {
        doc_id: doc_id.to_string(),
        snapshot_seq,
        frontier_tag: actual,
        pruned,
        kept,
        size_bytes,
    }))
}

/// Compact if the policy says so.
pub async fn check_and_compact(
    store: &dyn UpdateStore,
    doc_id: &str,
    policy: &CompactionPolicy,
    now: u64,
) -> std::result::Result<Option<CompactionReport>, CompactionError> {
    let updates = store.get_updates(doc_id).await?;
    let snapshot = store.get_latest_snapshot(doc_id).await?;
    if !should_compact(policy, &updates, snapshot.as_ref(), now) {
        debug!("Skipping compaction of {} ({} updates)", doc_id, updates.len());
        return Ok(None);
    }
    run_compaction(store, doc_id, policy, now).await
}
