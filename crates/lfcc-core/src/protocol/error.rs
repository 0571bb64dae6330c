//! Wire error taxonomy.
//!
//! Errors on the wire are data. Every code has a fixed category and retry
//! policy so clients can tell retryable conditions from fatal ones.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Policy,
    Conflict,
    Capacity,
    RateLimit,
    Auth,
    Timeout,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnsupportedVersion,
    HandshakeRequired,
    PolicyMismatch,
    FrontierConflict,
    CatchUpRequired,
    OutOfOrder,
    UpdateTooLarge,
    RoomFull,
    RateLimited,
    Unauthorized,
    HandshakeTimeout,
    IdleTimeout,
    DocNotFound,
    InternalError,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidMessage | Self::UnsupportedVersion | Self::HandshakeRequired => {
                ErrorCategory::Validation
            }
            Self::PolicyMismatch => ErrorCategory::Policy,
            Self::FrontierConflict | Self::CatchUpRequired | Self::OutOfOrder => {
                ErrorCategory::Conflict
            }
            Self::UpdateTooLarge | Self::RoomFull => ErrorCategory::Capacity,
            Self::RateLimited => ErrorCategory::RateLimit,
            Self::Unauthorized => ErrorCategory::Auth,
            Self::HandshakeTimeout | Self::IdleTimeout => ErrorCategory::Timeout,
            Self::DocNotFound => ErrorCategory::NotFound,
            Self::InternalError => ErrorCategory::Internal,
        }
    }

    /// Whether a client may retry automatically.
    pub fn retryable(&self) -> bool {
        match self.category() {
            ErrorCategory::Conflict
            | ErrorCategory::RateLimit
            | ErrorCategory::Timeout
            | ErrorCategory::Internal => true,
            ErrorCategory::Validation
            | ErrorCategory::Policy
            | ErrorCategory::Capacity
            | ErrorCategory::Auth
            | ErrorCategory::NotFound => false,
        }
    }

    /// Whether the server tears the connection down after sending this error.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion
                | Self::PolicyMismatch
                | Self::RoomFull
                | Self::Unauthorized
                | Self::HandshakeTimeout
                | Self::IdleTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::HandshakeRequired => "HANDSHAKE_REQUIRED",
            Self::PolicyMismatch => "POLICY_MISMATCH",
            Self::FrontierConflict => "FRONTIER_CONFLICT",
            Self::CatchUpRequired => "CATCH_UP_REQUIRED",
            Self::OutOfOrder => "OUT_OF_ORDER",
            Self::UpdateTooLarge => "UPDATE_TOO_LARGE",
            Self::RoomFull => "ROOM_FULL",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::DocNotFound => "DOC_NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            message: message.into(),
            retryable: code.retryable(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Category and retry flag must agree with the code.
    pub fn is_consistent(&self) -> bool {
        self.category == self.code.category() && self.retryable == self.code.retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_message_is_fatal_validation() {
        let payload = ErrorPayload::new(ErrorCode::InvalidMessage, "bad");
        assert_eq!(payload.category, ErrorCategory::Validation);
        assert!(!payload.retryable);
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let payload = ErrorPayload::new(ErrorCode::RateLimited, "slow down").with_retry_after(500);
        assert!(payload.retryable);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"code\":\"RATE_LIMITED\""));
        assert!(json.contains("\"category\":\"rate_limit\""));
        assert!(json.contains("\"retryAfterMs\":500"));
    }

    #[test]
    fn test_wire_codes_match_as_str() {
        for code in [
            ErrorCode::InvalidMessage,
            ErrorCode::FrontierConflict,
            ErrorCode::HandshakeTimeout,
            ErrorCode::DocNotFound,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_consistency_check() {
        let mut payload = ErrorPayload::new(ErrorCode::RoomFull, "full");
        assert!(payload.is_consistent());
        payload.retryable = true;
        assert!(!payload.is_consistent());
    }
}
