//! The wire-level message record.
//!
//! Headers are opaque string pairs at this layer; the transport assigns
//! meaning to its reserved names. The engine stamps `local_id` when a
//! message first lands in a queue and keeps it stable across sub-queue
//! moves, so schedulers can re-address a parked message later.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message as stored by the queue engine: opaque payload plus headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Engine-assigned identifier, unique per engine instance.
    ///
    /// Zero until the message has been enqueued.
    pub local_id: u64,

    /// String headers; reserved names are interpreted by the transport
    pub headers: HashMap<String, String>,

    /// Opaque payload bytes produced by the injected serializer
    pub body: Vec<u8>,
}

impl QueueMessage {
    /// Build a message that has not been enqueued yet
    pub fn new(headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            local_id: 0,
            headers,
            body,
        }
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set a header, replacing any previous value
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}
