//! Per-message dispatch.
//!
//! The dispatcher owns the transactional boundary of one received message:
//! decode, per-element fan-out to subscribers, reply flushing, and the
//! completion step that commits or rolls back. It is synchronous within a
//! worker; errors are funnelled into event notifications and never unwind
//! past it.
//!
//! A deterministic deserialization failure still cycles through the retry
//! budget: the event fires, the transaction rolls back, and the message is
//! re-attempted until the error action quarantines it. That keeps poison
//! handling in one place.

use std::sync::{Arc, Mutex};

use courier_queue::{QueueMessage, QueueTransaction, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS};
use tracing::{error, warn};
use uuid::Uuid;

use crate::context::{self, CurrentMessageInformation, DispatchScope};
use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};
use crate::events::{EventBus, FailureDisposition};
use crate::message::{headers, stamp_outbound, TransportMessageExt};
use crate::serializer::{LogicalMessage, MessageSerializer};
use crate::stats::TransportStatistics;

/// Which event pair a dispatch goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    /// `MessageArrived` / `MessageProcessingCompleted`, with the pre-commit hook
    Ordinary,
    /// The administrative event pair, with no pre-commit hook
    Administrative,
}

impl DispatchKind {
    fn is_administrative(self) -> bool {
        matches!(self, Self::Administrative)
    }
}

pub(crate) struct Dispatcher {
    serializer: MessageSerializer,
    bus: EventBus,
    local: Endpoint,
    stats: Arc<TransportStatistics>,
}

impl Dispatcher {
    pub(crate) fn new(
        serializer: MessageSerializer,
        bus: EventBus,
        local: Endpoint,
        stats: Arc<TransportStatistics>,
    ) -> Self {
        Self {
            serializer,
            bus,
            local,
            stats,
        }
    }

    /// Dispatch one received message inside its transaction.
    ///
    /// Every outcome is terminal: commit (consumed or diverted) or rollback
    /// (retried later). Failures surface as events, not as return values.
    pub(crate) fn dispatch(
        &self,
        message: QueueMessage,
        mut tx: QueueTransaction,
        kind: DispatchKind,
    ) {
        let mut info = CurrentMessageInformation {
            message_id: message.message_id(),
            source: message.source_endpoint(),
            destination: self.local.clone(),
            all_messages: Vec::new(),
            current_message: None,
            transport_message_id: message.local_id,
            queue: self.local.queue_name().as_main(),
        };

        let decoded = match self.serializer.deserialize(&message.body) {
            Ok(decoded) => decoded,
            Err(dispatch_error) => {
                self.bus.notify_serialization_error(&info, &dispatch_error);
                self.fail(tx, &info, dispatch_error, kind);
                return;
            }
        };
        info.all_messages = decoded.clone();

        let mut failure: Option<CourierError> = None;
        for element in &decoded {
            info.current_message = Some(element.clone());

            let replies = Arc::new(Mutex::new(Vec::new()));
            let scope = DispatchScope {
                info: info.clone(),
                replies: Arc::clone(&replies),
            };
            let verdict = context::enter_scope(scope, || {
                self.bus.notify_arrival(kind.is_administrative(), &info)
            });

            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.discard(&mut tx, &message, element) {
                        failure = Some(e);
                        break;
                    }
                    self.stats.record_discarded();
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }

            if let Err(e) = self.flush_replies(&mut tx, &info, &replies) {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => self.complete(tx, &info, kind),
            Some(dispatch_error) => self.fail(tx, &info, dispatch_error, kind),
        }
    }

    /// Success path: pre-commit hook (ordinary only), then commit, then the
    /// completion event
    fn complete(&self, tx: QueueTransaction, info: &CurrentMessageInformation, kind: DispatchKind) {
        let pre_commit = match kind {
            DispatchKind::Ordinary => self.bus.notify_before_commit(info),
            DispatchKind::Administrative => Ok(()),
        };

        match pre_commit {
            Err(hook_error) => self.fail(tx, info, hook_error, kind),
            Ok(()) => match tx.commit() {
                Ok(()) => {
                    self.stats.record_processed();
                    self.bus
                        .notify_completed(kind.is_administrative(), info, None);
                }
                Err(commit_error) => {
                    // The commit consumed the transaction; the message is
                    // back on the queue and a later attempt may quarantine it.
                    let dispatch_error = CourierError::from(commit_error);
                    warn!(
                        message_id = %info.message_id,
                        error = %dispatch_error,
                        "transaction commit failed"
                    );
                    let _ = self.bus.notify_failure(info, &dispatch_error);
                    self.stats.record_failed();
                    self.bus
                        .notify_completed(kind.is_administrative(), info, Some(&dispatch_error));
                }
            },
        }
    }

    /// Failure path: consult the failure policy, roll back or quarantine,
    /// then the completion event
    fn fail(
        &self,
        tx: QueueTransaction,
        info: &CurrentMessageInformation,
        dispatch_error: CourierError,
        kind: DispatchKind,
    ) {
        match self.bus.notify_failure(info, &dispatch_error) {
            FailureDisposition::Retry => drop(tx),
            FailureDisposition::Poison { retries } => {
                match self.quarantine(tx, info, retries) {
                    Ok(()) => {
                        self.stats.record_poisoned();
                        warn!(
                            message_id = %info.message_id,
                            retries,
                            "message quarantined in the errors sub-queue"
                        );
                    }
                    Err(e) => error!(
                        message_id = %info.message_id,
                        error = %e,
                        "failed to quarantine message; it will be retried"
                    ),
                }
            }
        }

        self.stats.record_failed();
        self.bus
            .notify_completed(kind.is_administrative(), info, Some(&dispatch_error));
    }

    /// Move the received message to `errors`, stamping the final retry count
    fn quarantine(
        &self,
        mut tx: QueueTransaction,
        info: &CurrentMessageInformation,
        retries: u32,
    ) -> CourierResult<()> {
        let errors_queue = info.queue.with_subqueue(SUBQUEUE_ERRORS)?;
        if let Some(message_headers) = tx.received_headers_mut(info.transport_message_id) {
            message_headers.insert(headers::RETRIES.to_string(), retries.to_string());
        }
        tx.divert_received(info.transport_message_id, &errors_queue)?;
        tx.commit()?;
        Ok(())
    }

    /// Re-send an unconsumed element to the `discarded` sub-queue
    fn discard(
        &self,
        tx: &mut QueueTransaction,
        original: &QueueMessage,
        element: &LogicalMessage,
    ) -> CourierResult<()> {
        let discarded_queue = self
            .local
            .queue_name()
            .as_main()
            .with_subqueue(SUBQUEUE_DISCARDED)?;
        let body = self.serializer.serialize(std::slice::from_ref(element))?;
        tx.send(
            &discarded_queue,
            QueueMessage::new(original.headers.clone(), body),
        )?;
        Ok(())
    }

    /// Send staged replies to the source endpoint inside the dispatch
    /// transaction
    fn flush_replies(
        &self,
        tx: &mut QueueTransaction,
        info: &CurrentMessageInformation,
        replies: &Arc<Mutex<Vec<Vec<LogicalMessage>>>>,
    ) -> CourierResult<()> {
        let staged = {
            let mut guard = replies.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        if staged.is_empty() {
            return Ok(());
        }

        let source = info
            .source
            .as_ref()
            .ok_or(CourierError::MissingHeader(headers::SOURCE))?;
        for messages in staged {
            let reply_id = Uuid::new_v4();
            let marker = messages[0].class.kind_marker();
            let body = self.serializer.serialize(&messages)?;
            tx.send(
                source.queue_name(),
                QueueMessage::new(stamp_outbound(reply_id, marker, &self.local), body),
            )?;
        }
        Ok(())
    }
}
