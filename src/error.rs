//! Transport error types.

use courier_queue::QueueError;
use thiserror::Error;

/// Errors surfaced by the courier transport
#[derive(Debug, Error)]
pub enum CourierError {
    /// A queue engine operation failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Payload bytes could not be decoded into logical messages
    #[error("failed to decode message payload: {0}")]
    Serialization(String),

    /// A payload decoded to an empty sequence, which the protocol forbids
    #[error("message payload decoded to an empty sequence")]
    EmptyPayload,

    /// An endpoint URI failed to parse
    #[error("invalid endpoint '{uri}': {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    /// A reserved header the operation needs is absent
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    /// A reserved header is present but unparseable
    #[error("malformed header '{header}': {reason}")]
    MalformedHeader {
        header: &'static str,
        reason: String,
    },

    /// The transport has already been started once
    #[error("transport already started")]
    AlreadyStarted,

    /// `reply` was called outside a message handler
    #[error("reply is only valid inside a message handler")]
    OutsideDispatch,

    /// A subscriber handler reported a failure
    #[error("message handler failed: {0}")]
    Handler(String),

    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CourierError {
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        Self::Serialization(reason.to_string())
    }

    pub fn invalid_endpoint(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidEndpoint {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed_header(header: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedHeader {
            header,
            reason: reason.to_string(),
        }
    }

    pub fn handler(reason: impl std::fmt::Display) -> Self {
        Self::Handler(reason.to_string())
    }

    pub fn configuration(reason: impl std::fmt::Display) -> Self {
        Self::Configuration(reason.to_string())
    }
}

/// Result alias used across the transport
pub type CourierResult<T> = Result<T, CourierError>;
