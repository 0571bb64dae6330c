//! Event infrastructure for lfcc-core.
//!
//! Provides `LfccEvent` for UI badges and monitoring, and `EventBus` for
//! subscriptions. Hosts wrap the bus in `Arc` and hand it to the client state
//! machine and the integrity scanner.

use crate::divergence::DivergenceBanner;
use crate::integrity::ScanMode;
use crate::client::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync and integrity layers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LfccEvent {
    /// Client connection moved between protocol states.
    ConnectionStateChanged {
        #[serde(rename = "docId")]
        doc_id: String,
        from: ConnectionState,
        to: ConnectionState,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// An integrity scan finished.
    ScanCompleted {
        mode: ScanMode,
        ok: bool,
        #[serde(rename = "failureCount")]
        failure_count: usize,
        timestamp: u64,
    },
    /// Irrecoverable divergence; the host should show the recovery banner.
    DivergenceDetected {
        banner: DivergenceBanner,
        timestamp: u64,
    },
    /// A compaction pass wrote a new snapshot.
    CompactionCompleted {
        #[serde(rename = "docId")]
        doc_id: String,
        #[serde(rename = "snapshotSeq")]
        snapshot_seq: u64,
        pruned: usize,
        timestamp: u64,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(LfccEvent) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(LfccEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: LfccEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn compaction_event(seq: u64) -> LfccEvent {
        LfccEvent::CompactionCompleted {
            doc_id: "doc".into(),
            snapshot_seq: seq,
            pruned: 3,
            timestamp: 1,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event| seen_clone.lock().unwrap().push(event));

        bus.emit(compaction_event(1));
        bus.emit(compaction_event(2));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&compaction_event(7)).unwrap();
        assert!(json.contains("\"type\":\"compactionCompleted\""));
        assert!(json.contains("\"snapshotSeq\":7"));
        assert!(json.contains("\"docId\":\"doc\""));
    }
}
