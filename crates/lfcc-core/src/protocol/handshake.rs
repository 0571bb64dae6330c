//! Handshake payloads.
//!
//! The handshake is the first message on every connection. The server answers
//! with the negotiated manifest, or with a `POLICY_MISMATCH` error followed by a
//! close.

use crate::crdt::FrontierTag;
use crate::policy::{DegradedFeatures, PolicyManifestV09};
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the envelope or payloads.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Upper bound for a single WebSocket frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Optional features a peer supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_update_bytes: Option<usize>,
}

impl Capabilities {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub client_manifest: PolicyManifestV09,
    pub client_manifest_hash: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Last frontier the client had acknowledged; absent on first connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_frontier_tag: Option<FrontierTag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAckPayload {
    pub server_manifest: PolicyManifestV09,
    pub server_manifest_hash: String,
    pub effective_manifest: PolicyManifestV09,
    pub chosen_manifest_hash: String,
    pub session_id: String,
    pub needs_catch_up: bool,
    pub server_frontier_tag: FrontierTag,
    #[serde(default)]
    pub degraded: DegradedFeatures,
    #[serde(default)]
    pub server_capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::manifest_hash;

    #[test]
    fn test_handshake_wire_format() {
        let manifest = PolicyManifestV09::default();
        let payload = HandshakePayload {
            client_manifest_hash: manifest_hash(&manifest).unwrap(),
            client_manifest: manifest,
            capabilities: Capabilities::default(),
            last_frontier_tag: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"clientManifest\":{"));
        assert!(json.contains("\"clientManifestHash\":"));
        // First connect carries no frontier
        assert!(!json.contains("lastFrontierTag"));
    }

    #[test]
    fn test_capabilities_default_when_absent() {
        let manifest = serde_json::to_value(PolicyManifestV09::default()).unwrap();
        let json = serde_json::json!({
            "clientManifest": manifest,
            "clientManifestHash": "abc",
            "lastFrontierTag": "00ff",
        });
        let payload: HandshakePayload = serde_json::from_value(json).unwrap();
        assert!(payload.capabilities.features.is_empty());
        assert_eq!(payload.last_frontier_tag, Some(FrontierTag::from("00ff")));
    }

    #[test]
    fn test_capability_lookup() {
        let caps = Capabilities {
            features: vec!["presence".into()],
            max_update_bytes: None,
        };
        assert!(caps.supports("presence"));
        assert!(!caps.supports("snapshots"));
    }
}
