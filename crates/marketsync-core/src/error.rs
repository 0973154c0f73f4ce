//! Error taxonomy for the sync engine.
//!
//! Decode and reconciliation failures are isolated per event; transport
//! failures restart only the affected subscription; verification failures
//! are surfaced to the calling write request.

use thiserror::Error;

/// A raw log could not be turned into a typed event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// topic0 does not match any known event signature.
    #[error("unknown event topic: {0}")]
    UnknownTopic(String),

    #[error("log has no topics")]
    NoTopics,

    #[error("event '{event}' expects {expected} topics, got {actual}")]
    TopicCount {
        event: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("ABI decode failed for '{event}': {reason}")]
    AbiDecode { event: &'static str, reason: String },

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("field '{field}' has unexpected type, expected {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
    },

    #[error("value of '{0}' does not fit the target integer type")]
    Overflow(String),
}

/// Chain gateway failures (HTTP, WebSocket, JSON-RPC).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The server ended the subscription stream.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if the error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } | Self::SubscriptionClosed(_)
        )
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(String),

    /// A submitted fact contradicts the contract state.
    #[error("verification mismatch on '{field}': expected {expected}, chain has {actual}")]
    VerificationMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// The contract could not be read after all attempts.
    #[error("on-chain verification unavailable: {0}")]
    VerificationUnavailable(String),

    #[error("unresolved event {key}: {reason}")]
    Anomaly { key: String, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns `true` for errors that reject a write without touching state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::VerificationMismatch { .. } | Self::Unauthorized(_) | Self::InvalidState(_)
        )
    }
}
