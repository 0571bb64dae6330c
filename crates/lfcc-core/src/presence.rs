//! Server-side presence store with TTL expiry.

use crate::protocol::{PeerPresence, PresencePayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Presences not refreshed within this window are dropped.
    pub ttl_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

/// Live presences per document, keyed by client id.
#[derive(Debug, Default)]
pub struct PresenceStore {
    ttl_ms: u64,
    docs: HashMap<String, BTreeMap<String, PeerPresence>>,
}

impl PresenceStore {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            ttl_ms: config.ttl_ms,
            docs: HashMap::new(),
        }
    }

    pub fn update(&mut self, doc_id: &str, client_id: &str, presence: PresencePayload, now: u64) {
        self.docs.entry(doc_id.to_string()).or_default().insert(
            client_id.to_string(),
            PeerPresence {
                client_id: client_id.to_string(),
                presence,
                last_seen: now,
            },
        );
    }

    pub fn remove(&mut self, doc_id: &str, client_id: &str) {
        if let Some(peers) = self.docs.get_mut(doc_id) {
            peers.remove(client_id);
            if peers.is_empty() {
                self.docs.remove(doc_id);
            }
        }
    }

    /// Live peers of a document, ordered by client id.
    pub fn peers(&self, doc_id: &str, except: Option<&str>) -> Vec<PeerPresence> {
        self.docs
            .get(doc_id)
            .map(|peers| {
                peers
                    .values()
                    .filter(|p| Some(p.client_id.as_str()) != except)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop presences older than the TTL. Returns `(doc_id, client_id)` of each.
    pub fn sweep_stale(&mut self, now: u64) -> Vec<(String, String)> {
        let ttl = self.ttl_ms;
        let mut dropped = Vec::new();
        for (doc_id, peers) in self.docs.iter_mut() {
            peers.retain(|client_id, p| {
                let live = now.saturating_sub(p.last_seen) <= ttl;
                if !live {
                    dropped.push((doc_id.clone(), client_id.clone()));
                }
                live
            });
        }
        self.docs.retain(|_, peers| !peers.is_empty());
        dropped
    }

    pub fn len(&self) -> usize {
        self.docs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;

    fn active() -> PresencePayload {
        PresencePayload {
            status: Some(PresenceStatus::Active),
            ..Default::default()
        }
    }

    #[test]
    fn test_update_and_list() {
        let mut store = PresenceStore::new(&PresenceConfig::default());
        store.update("doc", "bob", active(), 10);
        store.update("doc", "alice", active(), 20);
        store.update("other", "carol", active(), 20);

        let peers = store.peers("doc", None);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].client_id, "alice");
        assert_eq!(store.peers("doc", Some("alice")).len(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_sweep_drops_stale() {
        let mut store = PresenceStore::new(&PresenceConfig { ttl_ms: 100 });
        store.update("doc", "old", active(), 0);
        store.update("doc", "fresh", active(), 150);

        let dropped = store.sweep_stale(200);
        assert_eq!(dropped, vec![("doc".to_string(), "old".to_string())]);
        assert_eq!(store.peers("doc", None).len(), 1);
    }

    #[test]
    fn test_remove_last_peer_clears_doc() {
        let mut store = PresenceStore::new(&PresenceConfig::default());
        store.update("doc", "a", active(), 0);
        store.remove("doc", "a");
        assert!(store.is_empty());
    }
}
