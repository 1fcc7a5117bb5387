//! Logical messages and the injected serializer.
//!
//! A payload carries a non-empty ordered sequence of [`LogicalMessage`]
//! envelopes; the first element's class determines the kind marker stamped
//! on the wire. Serializers use enum dispatch like the queue engine
//! providers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CourierError, CourierResult};
use crate::message::MessageKind;

/// Routing class of a logical message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    #[default]
    Ordinary,
    Administrative,
    LoadBalancer,
}

impl MessageClass {
    /// The kind marker a send stamps when this class leads the payload
    pub fn kind_marker(self) -> MessageKind {
        match self {
            Self::Ordinary => MessageKind::Ordinary,
            Self::Administrative => MessageKind::Administrative,
            Self::LoadBalancer => MessageKind::LoadBalancer,
        }
    }
}

/// A decoded application message: a type name plus its JSON body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Application-level type name of the body
    #[serde(rename = "type")]
    pub type_name: String,

    /// Routing class; ordinary unless the sender says otherwise
    #[serde(default, skip_serializing_if = "is_ordinary")]
    pub class: MessageClass,

    /// The message body
    pub body: Value,
}

fn is_ordinary(class: &MessageClass) -> bool {
    *class == MessageClass::Ordinary
}

impl LogicalMessage {
    pub fn new(type_name: impl Into<String>, body: Value) -> Self {
        Self {
            type_name: type_name.into(),
            class: MessageClass::Ordinary,
            body,
        }
    }

    /// A control-plane message that bypasses pre-commit hooks on dispatch
    pub fn administrative(type_name: impl Into<String>, body: Value) -> Self {
        Self {
            type_name: type_name.into(),
            class: MessageClass::Administrative,
            body,
        }
    }

    pub fn load_balancer(type_name: impl Into<String>, body: Value) -> Self {
        Self {
            type_name: type_name.into(),
            class: MessageClass::LoadBalancer,
            body,
        }
    }

    /// Convenience constructor for plain string payloads
    pub fn text(value: impl Into<String>) -> Self {
        Self::new("String", Value::String(value.into()))
    }
}

/// Serializer provider for logical message sequences
#[derive(Debug, Clone)]
pub enum MessageSerializer {
    Json,
    // Future variants can be added as needed:
    // Binary(BinarySerializer),
}

impl MessageSerializer {
    pub fn json() -> Self {
        Self::Json
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }

    /// Encode a non-empty sequence into payload bytes
    pub fn serialize(&self, messages: &[LogicalMessage]) -> CourierResult<Vec<u8>> {
        if messages.is_empty() {
            return Err(CourierError::EmptyPayload);
        }
        match self {
            Self::Json => serde_json::to_vec(messages).map_err(CourierError::serialization),
        }
    }

    /// Decode payload bytes into a sequence; an empty sequence is a
    /// protocol violation
    pub fn deserialize(&self, payload: &[u8]) -> CourierResult<Vec<LogicalMessage>> {
        let messages: Vec<LogicalMessage> = match self {
            Self::Json => {
                serde_json::from_slice(payload).map_err(CourierError::serialization)?
            }
        };
        if messages.is_empty() {
            return Err(CourierError::EmptyPayload);
        }
        Ok(messages)
    }
}
