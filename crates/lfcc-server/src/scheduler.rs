//! Per-document compaction timers.
//!
//! Each active document gets one tokio interval that runs
//! [`check_and_compact`] at the policy's `time_threshold_minutes` cadence.
//! [`CompactionScheduler::trigger`] runs the same check immediately, e.g. after
//! a burst of updates. A document never compacts concurrently with itself: a
//! trigger that finds a pass already running does nothing.

use lfcc_core::clock::now_ms;
use lfcc_core::{
    check_and_compact, CompactionError, CompactionPolicy, CompactionReport, EventBus, LfccEvent,
    UpdateStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Shared {
    store: Arc<dyn UpdateStore>,
    policy: CompactionPolicy,
    events: Arc<EventBus>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the document from the in-flight set when the pass ends.
struct InFlight<'a> {
    shared: &'a Shared,
    doc_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.doc_id);
    }
}

impl Shared {
    fn claim(&self, doc_id: &str) -> Option<InFlight<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(doc_id.to_string()) {
            return None;
        }
        Some(InFlight {
            shared: self,
            doc_id: doc_id.to_string(),
        })
    }

    async fn compact(&self, doc_id: &str) -> Result<Option<CompactionReport>, CompactionError> {
        let Some(_guard) = self.claim(doc_id) else {
            debug!("Compaction of {} already running, skipping", doc_id);
            return Ok(None);
        };

        let now = now_ms();
        let report = check_and_compact(self.store.as_ref(), doc_id, &self.policy, now).await?;
        if let Some(report) = &report {
            debug!("Publishing compaction of {} (snapshot {})", doc_id, report.snapshot_seq);
            self.events.emit(LfccEvent::CompactionCompleted {
                doc_id: doc_id.to_string(),
                snapshot_seq: report.snapshot_seq,
                pruned: report.pruned,
                timestamp: now,
            });
        }
        Ok(report)
    }

    /// Compact and log failures; the next tick retries.
    async fn compact_logged(&self, doc_id: &str) {
        if let Err(e) = self.compact(doc_id).await {
            error!("Compaction of {} failed: {}", doc_id, e);
        }
    }
}

/// Owns one compaction timer per active document.
pub struct CompactionScheduler {
    shared: Arc<Shared>,
    timers: HashMap<String, JoinHandle<()>>,
    /// Updates applied per active document since its last trigger.
    applied: HashMap<String, usize>,
}

impl CompactionScheduler {
    pub fn new(store: Arc<dyn UpdateStore>, policy: CompactionPolicy, events: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                policy,
                events,
                in_flight: Mutex::new(HashSet::new()),
            }),
            timers: HashMap::new(),
            applied: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.shared.policy
    }

    /// Start the document's timer unless it is already running.
    pub fn ensure_timer(&mut self, doc_id: &str) {
        if self.timers.contains_key(doc_id) {
            return;
        }
        let period = Duration::from_secs(self.shared.policy.time_threshold_minutes.max(1) * 60);
        let shared = Arc::clone(&self.shared);
        let doc = doc_id.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                shared.compact_logged(&doc).await;
            }
        });
        debug!("Started compaction timer for {}", doc_id);
        self.timers.insert(doc_id.to_string(), handle);
    }

    /// Stop the document's timer and run one last check in the background.
    pub fn stop_timer(&mut self, doc_id: &str) {
        if let Some(handle) = self.timers.remove(doc_id) {
            handle.abort();
            debug!("Stopped compaction timer for {}", doc_id);
            self.trigger(doc_id);
        }
    }

    /// Keep exactly one timer per document in `active`.
    pub fn sync_timers(&mut self, active: &[String]) {
        let stale: Vec<String> = self
            .timers
            .keys()
            .filter(|doc| !active.contains(doc))
            .cloned()
            .collect();
        for doc in stale {
            self.stop_timer(&doc);
        }
        self.applied.retain(|doc, _| active.contains(doc));
        for doc in active {
            self.ensure_timer(doc);
        }
    }

    pub fn has_timer(&self, doc_id: &str) -> bool {
        self.timers.contains_key(doc_id)
    }

    /// Count one applied update; triggers a check once a burst reaches the
    /// update threshold.
    pub fn note_applied(&mut self, doc_id: &str) -> Option<JoinHandle<()>> {
        let threshold = self.shared.policy.update_threshold.max(1);
        let count = self.applied.entry(doc_id.to_string()).or_insert(0);
        *count += 1;
        if *count < threshold {
            return None;
        }
        *count = 0;
        debug!("{} reached {} updates, triggering compaction", doc_id, threshold);
        Some(self.trigger(doc_id))
    }

    /// Documents with a partial burst on record.
    pub fn pending_counts(&self) -> usize {
        self.applied.len()
    }

    /// Run a compaction check now, in the background.
    pub fn trigger(&self, doc_id: &str) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let doc = doc_id.to_string();
        tokio::spawn(async move { shared.compact_logged(&doc).await })
    }

    /// Run a compaction check and wait for it. `Ok(None)` when nothing was
    /// due or another pass for this document is in flight.
    pub async fn compact_now(&self, doc_id: &str) -> Result<Option<CompactionReport>, CompactionError> {
        self.shared.compact(doc_id).await
    }

    /// Abort every timer.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.applied.clear();
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
