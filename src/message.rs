//! Transport message semantics: reserved headers and message kinds.
//!
//! A wire-level message is an opaque payload plus string headers. The
//! transport populates and consumes the reserved names in [`headers`]; all
//! of them are case-sensitive ASCII. `time-to-send` is ISO-8601 UTC with
//! seven fractional-second digits (100 ns ticks).

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use courier_queue::QueueMessage;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};

/// Reserved header names
pub mod headers {
    /// Caller-assigned GUID for the logical message
    pub const ID: &str = "id";
    /// Message kind marker; see [`MessageKind`](super::MessageKind)
    pub const KIND: &str = "type";
    /// URI of the originating endpoint
    pub const SOURCE: &str = "source";
    /// Stamped on inbound messages by the queue engine; trusted when
    /// deserialization fails before the other headers can be
    pub const FROM: &str = "from";
    /// ISO-8601 UTC send time, present only on timeout messages
    pub const TIME_TO_SEND: &str = "time-to-send";
    /// Retry count, stamped by the error action
    pub const RETRIES: &str = "retries";
}

/// Message kind carried in the `type` header.
///
/// The receiving worker routes on this marker; senders stamp it from the
/// first logical message in the payload. Unknown values are treated as
/// ordinary, the routing decision belongs to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ordinary,
    Administrative,
    LoadBalancer,
    Timeout,
    Shutdown,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Administrative => "administrative",
            Self::LoadBalancer => "loadbalancer",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ordinary" => Some(Self::Ordinary),
            "administrative" => Some(Self::Administrative),
            "loadbalancer" => Some(Self::LoadBalancer),
            "timeout" => Some(Self::Timeout),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Reserved-header accessors for wire-level messages
pub trait TransportMessageExt {
    /// The logical message id, or nil when absent or unparseable
    fn message_id(&self) -> Uuid;

    /// The kind marker; missing or unknown values classify as ordinary
    fn kind(&self) -> MessageKind;

    /// The originating endpoint, falling back to the engine-stamped `from`
    /// header when `source` is absent
    fn source_endpoint(&self) -> Option<Endpoint>;

    /// Retry count, defaulting to zero
    fn retries(&self) -> u32;

    /// The deferred send time, when present
    fn time_to_send(&self) -> CourierResult<Option<DateTime<Utc>>>;
}

impl TransportMessageExt for QueueMessage {
    fn message_id(&self) -> Uuid {
        self.header(headers::ID)
            .and_then(|v| Uuid::parse_str(v).ok())
            .unwrap_or_else(Uuid::nil)
    }

    fn kind(&self) -> MessageKind {
        self.header(headers::KIND)
            .and_then(MessageKind::parse)
            .unwrap_or(MessageKind::Ordinary)
    }

    fn source_endpoint(&self) -> Option<Endpoint> {
        self.header(headers::SOURCE)
            .or_else(|| self.header(headers::FROM))
            .and_then(|uri| Endpoint::parse(uri).ok())
    }

    fn retries(&self) -> u32 {
        self.header(headers::RETRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn time_to_send(&self) -> CourierResult<Option<DateTime<Utc>>> {
        match self.header(headers::TIME_TO_SEND) {
            None => Ok(None),
            Some(value) => parse_time_to_send(value)
                .map(Some)
                .map_err(|e| CourierError::malformed_header(headers::TIME_TO_SEND, e)),
        }
    }
}

/// Stamp the headers every outbound message carries
pub fn stamp_outbound(
    message_id: Uuid,
    kind: MessageKind,
    source: &Endpoint,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(headers::ID.to_string(), message_id.to_string());
    map.insert(headers::KIND.to_string(), kind.as_str().to_string());
    map.insert(headers::SOURCE.to_string(), source.uri());
    map
}

/// Format a send time as ISO-8601 UTC with seven fractional digits
pub fn format_time_to_send(at: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        at.format("%Y-%m-%dT%H:%M:%S"),
        at.nanosecond() / 100
    )
}

/// Parse an ISO-8601 UTC send time
pub fn parse_time_to_send(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}
