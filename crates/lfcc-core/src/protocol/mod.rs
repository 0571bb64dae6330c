//! Wire protocol for client/server document sync.
//!
//! This module defines:
//! - The message envelope and its two-stage validation
//! - Handshake, catch-up, doc update, presence and liveness payloads
//! - The error taxonomy sent to clients

pub mod envelope;
pub mod error;
pub mod handshake;
pub mod messages;

pub use envelope::{Envelope, Message, MessageType, RawEnvelope, ValidationError};
pub use error::{ErrorCategory, ErrorCode, ErrorPayload};
pub use handshake::{
    Capabilities, HandshakeAckPayload, HandshakePayload, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use messages::{
    CatchUpMode, CatchUpRequestPayload, CatchUpResponsePayload, DocAckPayload, DocUpdatePayload,
    PeerPresence, PingPayload, PongPayload, PresenceAckPayload, PresencePayload, PresenceStatus,
};
