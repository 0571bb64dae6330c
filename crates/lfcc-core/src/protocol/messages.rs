//! Payloads for catch-up, document traffic, presence and liveness.
//!
//! Byte fields are `Vec<u8>` and serialise as JSON number arrays, matching the
//! browser client's `Array.from(bytes)` convention.

use crate::anchor::{Span, StableAnchor};
use crate::crdt::FrontierTag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpRequestPayload {
    /// Frontier to catch up from; `None` asks for everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_frontier_tag: Option<FrontierTag>,
    #[serde(default)]
    pub prefer_snapshot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpMode {
    Snapshot,
    Updates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpResponsePayload {
    pub mode: CatchUpMode,
    pub data: Vec<u8>,
    pub frontier_tag: FrontierTag,
    /// Number of stored updates the delta covers (0 for snapshots).
    #[serde(default)]
    pub update_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdatePayload {
    pub update: Vec<u8>,
    /// Sender's frontier after applying `update`.
    pub frontier_tag: FrontierTag,
    /// Frontier the update was produced against.
    pub parent_frontier_tag: FrontierTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocAckPayload {
    pub acked_seq: u64,
    pub server_frontier_tag: FrontierTag,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<StableAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub client_id: String,
    pub presence: PresencePayload,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceAckPayload {
    pub peers: Vec<PeerPresence>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    /// Timestamp of the ping being answered.
    pub echo_timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_update_bytes_as_number_array() {
        let payload = DocUpdatePayload {
            update: vec![0, 127, 255],
            frontier_tag: "aa".into(),
            parent_frontier_tag: "".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"update\":[0,127,255]"));
        assert!(json.contains("\"parentFrontierTag\":\"\""));
    }

    #[test]
    fn test_presence_fields_are_optional() {
        let payload: PresencePayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload, PresencePayload::default());

        let payload: PresencePayload = serde_json::from_str(
            r#"{"cursor":{"blockId":"b1","offset":3},"status":"idle"}"#,
        )
        .unwrap();
        assert_eq!(payload.cursor, Some(StableAnchor::new("b1", 3)));
        assert_eq!(payload.status, Some(PresenceStatus::Idle));
    }

    #[test]
    fn test_catch_up_mode_wire_format() {
        assert_eq!(serde_json::to_string(&CatchUpMode::Snapshot).unwrap(), "\"snapshot\"");
    }
}
