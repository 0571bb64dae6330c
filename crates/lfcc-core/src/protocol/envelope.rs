//! Message envelope and two-stage parsing.
//!
//! Incoming bytes are parsed into a [`RawEnvelope`] (header fields plus an
//! untyped payload), then the payload is parsed according to `type` and
//! checked. Anything that fails either stage is a [`ValidationError`] and must
//! not be acted upon.

use super::error::{ErrorCode, ErrorPayload};
use super::handshake::{HandshakeAckPayload, HandshakePayload, PROTOCOL_VERSION};
use super::messages::{
    CatchUpRequestPayload, CatchUpResponsePayload, DocAckPayload, DocUpdatePayload,
    PingPayload, PongPayload, PresenceAckPayload, PresencePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted display name in presence messages.
pub const MAX_DISPLAY_NAME_LEN: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {msg_type} payload: {reason}")]
    InvalidPayload {
        msg_type: MessageType,
        reason: String,
    },
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            _ => ErrorCode::InvalidMessage,
        }
    }

    pub fn to_error_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    DocUpdate,
    DocAck,
    Presence,
    PresenceAck,
    CatchUpRequest,
    CatchUpResponse,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::HandshakeAck => "handshake_ack",
            Self::DocUpdate => "doc_update",
            Self::DocAck => "doc_ack",
            Self::Presence => "presence",
            Self::PresenceAck => "presence_ack",
            Self::CatchUpRequest => "catch_up_request",
            Self::CatchUpResponse => "catch_up_response",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "handshake" => Self::Handshake,
            "handshake_ack" => Self::HandshakeAck,
            "doc_update" => Self::DocUpdate,
            "doc_ack" => Self::DocAck,
            "presence" => Self::Presence,
            "presence_ack" => Self::PresenceAck,
            "catch_up_request" => Self::CatchUpRequest,
            "catch_up_response" => Self::CatchUpResponse,
            "error" => Self::Error,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => return Err(ValidationError::UnknownType(other.to_string())),
        })
    }
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakePayload),
    HandshakeAck(HandshakeAckPayload),
    DocUpdate(DocUpdatePayload),
    DocAck(DocAckPayload),
    Presence(PresencePayload),
    PresenceAck(PresenceAckPayload),
    CatchUpRequest(CatchUpRequestPayload),
    CatchUpResponse(CatchUpResponsePayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Handshake(_) => MessageType::Handshake,
            Self::HandshakeAck(_) => MessageType::HandshakeAck,
            Self::DocUpdate(_) => MessageType::DocUpdate,
            Self::DocAck(_) => MessageType::DocAck,
            Self::Presence(_) => MessageType::Presence,
            Self::PresenceAck(_) => MessageType::PresenceAck,
            Self::CatchUpRequest(_) => MessageType::CatchUpRequest,
            Self::CatchUpResponse(_) => MessageType::CatchUpResponse,
            Self::Error(_) => MessageType::Error,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
        }
    }

    fn payload_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Handshake(p) => serde_json::to_value(p),
            Self::HandshakeAck(p) => serde_json::to_value(p),
            Self::DocUpdate(p) => serde_json::to_value(p),
            Self::DocAck(p) => serde_json::to_value(p),
            Self::Presence(p) => serde_json::to_value(p),
            Self::PresenceAck(p) => serde_json::to_value(p),
            Self::CatchUpRequest(p) => serde_json::to_value(p),
            Self::CatchUpResponse(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::Ping(p) => serde_json::to_value(p),
            Self::Pong(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(msg_type: MessageType, payload: Value) -> Result<Self, ValidationError> {
        fn parse<T: for<'de> Deserialize<'de>>(
            msg_type: MessageType,
            payload: Value,
        ) -> Result<T, ValidationError> {
            serde_json::from_value(payload).map_err(|e| ValidationError::InvalidPayload {
                msg_type,
                reason: e.to_string(),
            })
        }

        Ok(match msg_type {
            MessageType::Handshake => Self::Handshake(parse(msg_type, payload)?),
            MessageType::HandshakeAck => Self::HandshakeAck(parse(msg_type, payload)?),
            MessageType::DocUpdate => Self::DocUpdate(parse(msg_type, payload)?),
            MessageType::DocAck => Self::DocAck(parse(msg_type, payload)?),
            MessageType::Presence => Self::Presence(parse(msg_type, payload)?),
            MessageType::PresenceAck => Self::PresenceAck(parse(msg_type, payload)?),
            MessageType::CatchUpRequest => Self::CatchUpRequest(parse(msg_type, payload)?),
            MessageType::CatchUpResponse => Self::CatchUpResponse(parse(msg_type, payload)?),
            MessageType::Error => Self::Error(parse(msg_type, payload)?),
            MessageType::Ping => Self::Ping(parse(msg_type, payload)?),
            MessageType::Pong => Self::Pong(parse(msg_type, payload)?),
        })
    }

    /// Semantic checks that deserialisation cannot express.
    fn check(&self) -> Result<(), String> {
        match self {
            Self::Handshake(p) => {
                p.client_manifest.validate().map_err(|e| e.to_string())?;
                if p.client_manifest_hash.is_empty() {
                    return Err("clientManifestHash is empty".into());
                }
            }
            Self::HandshakeAck(p) => {
                if p.session_id.is_empty() {
                    return Err("sessionId is empty".into());
                }
            }
            Self::DocUpdate(p) => {
                if p.update.is_empty() {
                    return Err("update is empty".into());
                }
                if p.frontier_tag.is_empty() {
                    return Err("frontierTag is empty".into());
                }
            }
            Self::Presence(p) => {
                if p.selection.as_ref().is_some_and(|s| s.start > s.end) {
                    return Err("selection start is after end".into());
                }
                if p.display_name
                    .as_ref()
                    .is_some_and(|n| n.chars().count() > MAX_DISPLAY_NAME_LEN)
                {
                    return Err("displayName too long".into());
                }
            }
            Self::CatchUpResponse(p) => {
                if p.frontier_tag.is_empty() && !p.data.is_empty() {
                    return Err("frontierTag is empty".into());
                }
            }
            Self::Error(p) => {
                if !p.is_consistent() {
                    return Err(format!("category/retryable disagree with {}", p.code));
                }
            }
            Self::DocAck(_)
            | Self::PresenceAck(_)
            | Self::CatchUpRequest(_)
            | Self::Ping(_)
            | Self::Pong(_) => {}
        }
        Ok(())
    }
}

/// Envelope with an untyped payload: the first parsing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub doc_id: String,
    pub client_id: String,
    pub seq: u64,
    pub timestamp: u64,
    pub payload: Value,
}

/// A validated message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: String,
    pub doc_id: String,
    pub client_id: String,
    pub seq: u64,
    pub timestamp: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(
        doc_id: impl Into<String>,
        client_id: impl Into<String>,
        seq: u64,
        timestamp: u64,
        message: Message,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            doc_id: doc_id.into(),
            client_id: client_id.into(),
            seq,
            timestamp,
            message,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    pub fn to_raw(&self) -> serde_json::Result<RawEnvelope> {
        Ok(RawEnvelope {
            version: self.version.clone(),
            msg_type: self.message_type().as_str().to_string(),
            doc_id: self.doc_id.clone(),
            client_id: self.client_id.clone(),
            seq: self.seq,
            timestamp: self.timestamp,
            payload: self.message.payload_value()?,
        })
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.to_raw()?)
    }

    /// Parse and validate JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ValidationError> {
        let raw: RawEnvelope =
            serde_json::from_slice(data).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawEnvelope) -> Result<Self, ValidationError> {
        if raw.version != PROTOCOL_VERSION {
            return Err(ValidationError::UnsupportedVersion(raw.version));
        }
        if raw.doc_id.is_empty() {
            return Err(ValidationError::Malformed("docId is empty".into()));
        }
        if raw.client_id.is_empty() {
            return Err(ValidationError::Malformed("clientId is empty".into()));
        }
        let msg_type: MessageType = raw.msg_type.parse()?;
        let message = Message::from_payload(msg_type, raw.payload)?;
        message
            .check()
            .map_err(|reason| ValidationError::InvalidPayload { msg_type, reason })?;

        Ok(Self {
            version: raw.version,
            doc_id: raw.doc_id,
            client_id: raw.client_id,
            seq: raw.seq,
            timestamp: raw.timestamp,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{manifest_hash, PolicyManifestV09};
    use crate::protocol::Capabilities;
    use serde_json::json;

    fn ping() -> Envelope {
        Envelope::new("doc-1", "client-1", 1, 1000, Message::Ping(PingPayload {}))
    }

    // ==================== Envelope ====================

    #[test]
    fn test_envelope_wire_format() {
        let json = String::from_utf8(ping().to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"docId\":\"doc-1\""));
        assert!(json.contains("\"clientId\":\"client-1\""));
        assert!(json.contains("\"version\":\"1.0\""));
        assert!(json.contains("\"payload\":{}"));
    }

    #[test]
    fn test_envelope_parse_back() {
        let envelope = ping();
        assert_eq!(Envelope::from_json(&envelope.to_json().unwrap()).unwrap(), envelope);
    }

    #[test]
    fn test_handshake_parses_to_typed_message() {
        let manifest = PolicyManifestV09::default();
        let envelope = Envelope::new(
            "doc-1",
            "client-1",
            0,
            5,
            Message::Handshake(HandshakePayload {
                client_manifest_hash: manifest_hash(&manifest).unwrap(),
                client_manifest: manifest,
                capabilities: Capabilities::default(),
                last_frontier_tag: None,
            }),
        );
        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed.message_type(), MessageType::Handshake);
        assert!(matches!(parsed.message, Message::Handshake(_)));
    }

    // ==================== Validation ====================

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            Envelope::from_json(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(Envelope::from_json(b"{}").is_err());
        assert!(Envelope::from_json(b"").is_err());
    }

    #[test]
    fn test_missing_header_field() {
        let json = json!({"version": "1.0", "type": "ping", "docId": "d", "seq": 1, "timestamp": 1, "payload": {}});
        let err = Envelope::from_json(json.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_unknown_type() {
        let json = json!({"version": "1.0", "type": "gossip", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1, "payload": {}});
        let err = Envelope::from_json(json.to_string().as_bytes()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownType("gossip".into()));
        let payload = err.to_error_payload();
        assert_eq!(payload.code, ErrorCode::InvalidMessage);
        assert!(!payload.retryable);
    }

    #[test]
    fn test_wrong_version() {
        let json = json!({"version": "9.9", "type": "ping", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1, "payload": {}});
        let err = Envelope::from_json(json.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedVersion);
    }

    #[test]
    fn test_payload_shape_mismatch() {
        let json = json!({"version": "1.0", "type": "doc_update", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1, "payload": {"update": "not bytes"}});
        let err = Envelope::from_json(json.to_string().as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidPayload { msg_type: MessageType::DocUpdate, .. }
        ));
    }

    #[test]
    fn test_empty_update_rejected() {
        let json = json!({"version": "1.0", "type": "doc_update", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1,
            "payload": {"update": [], "frontierTag": "aa", "parentFrontierTag": ""}});
        assert!(Envelope::from_json(json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_inverted_selection_rejected() {
        let json = json!({"version": "1.0", "type": "presence", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1,
            "payload": {"selection": {"blockId": "b1", "start": 5, "end": 2}}});
        assert!(Envelope::from_json(json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_inconsistent_error_payload_rejected() {
        let json = json!({"version": "1.0", "type": "error", "docId": "d", "clientId": "c", "seq": 1, "timestamp": 1,
            "payload": {"code": "ROOM_FULL", "category": "capacity", "message": "full", "retryable": true}});
        assert!(Envelope::from_json(json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_message_type_names_roundtrip() {
        for name in ["handshake", "handshake_ack", "doc_update", "catch_up_response", "pong"] {
            let parsed: MessageType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }
}
