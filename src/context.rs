//! Per-dispatch context.
//!
//! [`CurrentMessageInformation`] lives for exactly one dispatch. It is also
//! held in task-local storage so subscriber code can call
//! [`reply`](crate::transport::QueueTransport::reply) without plumbing the
//! context through; replies staged that way are flushed inside the dispatch
//! transaction.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use courier_queue::QueueName;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};
use crate::message::headers;
use crate::serializer::LogicalMessage;

/// Context for the message currently being dispatched
#[derive(Debug, Clone)]
pub struct CurrentMessageInformation {
    /// Caller-assigned id of the logical message
    pub message_id: Uuid,
    /// Originating endpoint, when the headers carried one
    pub source: Option<Endpoint>,
    /// The local endpoint that received the message
    pub destination: Endpoint,
    /// The full decoded sequence
    pub all_messages: Vec<LogicalMessage>,
    /// The element currently being dispatched; absent when decoding failed
    pub current_message: Option<LogicalMessage>,
    /// Engine-assigned id of the wire-level message
    pub transport_message_id: u64,
    /// The queue the message was received from
    pub queue: QueueName,
}

/// Details of a committed outbound send
#[derive(Debug, Clone)]
pub struct SentMessageInformation {
    pub message_id: Uuid,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub messages: Vec<LogicalMessage>,
    pub sent_at: DateTime<Utc>,
}

/// Task-local state for one dispatched element
pub(crate) struct DispatchScope {
    pub(crate) info: CurrentMessageInformation,
    pub(crate) replies: Arc<Mutex<Vec<Vec<LogicalMessage>>>>,
}

tokio::task_local! {
    static CURRENT_MESSAGE: DispatchScope;
}

/// Run `f` with `scope` installed as the current dispatch context
pub(crate) fn enter_scope<R>(scope: DispatchScope, f: impl FnOnce() -> R) -> R {
    CURRENT_MESSAGE.sync_scope(scope, f)
}

/// The context of the dispatch in progress on this task, if any.
///
/// Subscribers must not retain the returned value beyond their callback.
pub fn current_message() -> Option<CurrentMessageInformation> {
    CURRENT_MESSAGE.try_with(|scope| scope.info.clone()).ok()
}

/// Stage a reply to the current message's source endpoint
pub(crate) fn stage_reply(messages: Vec<LogicalMessage>) -> CourierResult<()> {
    if messages.is_empty() {
        return Err(CourierError::EmptyPayload);
    }
    CURRENT_MESSAGE
        .try_with(|scope| {
            if scope.info.source.is_none() {
                return Err(CourierError::MissingHeader(headers::SOURCE));
            }
            scope
                .replies
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(messages);
            Ok(())
        })
        .map_err(|_| CourierError::OutsideDispatch)?
}
