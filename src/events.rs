//! The transport event bus.
//!
//! A small in-process pub/sub with one typed slot per lifecycle event, so
//! every slot has a statically known signature. Subscription and
//! unsubscription are safe while the transport is running; dispatch
//! iterates over a snapshot of the subscriber list.
//!
//! For every dispatched message, subscribers observe events strictly in the
//! order arrival → pre-commit → completion on success, and arrival →
//! failure → completion on failure.
//!
//! The failure *policy* is a distinct slot consulted before the failure
//! fan-out, which is how the error action is guaranteed to observe every
//! failure before user code regardless of registration order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::context::{CurrentMessageInformation, SentMessageInformation};
use crate::error::{CourierError, CourierResult};

/// Fired once when the transport has started
pub type StartedHandler = dyn Fn() + Send + Sync;

/// Arrival callback; `true` means "consumed". Errors fail the dispatch.
pub type ArrivalHandler =
    dyn Fn(&CurrentMessageInformation) -> CourierResult<bool> + Send + Sync;

/// Completion callback, fired on both the success and the failure path
pub type CompletionHandler =
    dyn Fn(&CurrentMessageInformation, Option<&CourierError>) + Send + Sync;

/// Failure and serialization-fault observer
pub type FailureHandler = dyn Fn(&CurrentMessageInformation, &CourierError) + Send + Sync;

/// Observer of committed outbound sends
pub type SentHandler = dyn Fn(&SentMessageInformation) + Send + Sync;

/// Hook invoked after a successful dispatch, before the transaction commits.
/// Errors fail the dispatch.
pub type BeforeCommitHandler = dyn Fn(&CurrentMessageInformation) -> CourierResult<()> + Send + Sync;

/// The failure-policy slot: decides the fate of a failed message before the
/// failure event fans out
pub type FailurePolicy =
    dyn Fn(&CurrentMessageInformation, &CourierError) -> FailureDisposition + Send + Sync;

/// Verdict of the failure policy for one failed dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Roll back and let the message be attempted again
    Retry,
    /// Quarantine the message in the `errors` sub-queue, stamping the
    /// number of attempts performed
    Poison { retries: u32 },
}

/// Identifies the slot a [`Subscription`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Started,
    MessageArrived,
    AdministrativeMessageArrived,
    MessageProcessingCompleted,
    AdministrativeMessageProcessingCompleted,
    MessageProcessingFailure,
    MessageSerializationError,
    MessageSent,
    BeforeMessageTransactionCommit,
}

/// Token returned by a subscribe call; pass to [`EventBus::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    slot: Slot,
    id: u64,
}

type Handlers<H> = RwLock<Vec<(u64, Arc<H>)>>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    started: Handlers<StartedHandler>,
    message_arrived: Handlers<ArrivalHandler>,
    admin_arrived: Handlers<ArrivalHandler>,
    completed: Handlers<CompletionHandler>,
    admin_completed: Handlers<CompletionHandler>,
    failure: Handlers<FailureHandler>,
    serialization_error: Handlers<FailureHandler>,
    sent: Handlers<SentHandler>,
    before_commit: Handlers<BeforeCommitHandler>,
    failure_policy: RwLock<Option<Arc<FailurePolicy>>>,
}

/// Registry of lifecycle event subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

fn snapshot<H: ?Sized>(handlers: &Handlers<H>) -> Vec<Arc<H>> {
    handlers
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .iter()
        .map(|(_, h)| h.clone())
        .collect()
}

fn remove<H: ?Sized>(handlers: &Handlers<H>, id: u64) {
    handlers
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .retain(|(hid, _)| *hid != id);
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<H: ?Sized>(&self, handlers: &Handlers<H>, slot: Slot, handler: Arc<H>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, handler));
        Subscription { slot, id }
    }

    // =========================================================================
    // Subscription surface
    // =========================================================================

    pub fn on_started(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.insert(&self.inner.started, Slot::Started, Arc::new(handler))
    }

    pub fn on_message_arrived(
        &self,
        handler: impl Fn(&CurrentMessageInformation) -> CourierResult<bool> + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.message_arrived,
            Slot::MessageArrived,
            Arc::new(handler),
        )
    }

    pub fn on_administrative_message_arrived(
        &self,
        handler: impl Fn(&CurrentMessageInformation) -> CourierResult<bool> + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.admin_arrived,
            Slot::AdministrativeMessageArrived,
            Arc::new(handler),
        )
    }

    pub fn on_message_processing_completed(
        &self,
        handler: impl Fn(&CurrentMessageInformation, Option<&CourierError>) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.completed,
            Slot::MessageProcessingCompleted,
            Arc::new(handler),
        )
    }

    pub fn on_administrative_message_processing_completed(
        &self,
        handler: impl Fn(&CurrentMessageInformation, Option<&CourierError>) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.admin_completed,
            Slot::AdministrativeMessageProcessingCompleted,
            Arc::new(handler),
        )
    }

    pub fn on_message_processing_failure(
        &self,
        handler: impl Fn(&CurrentMessageInformation, &CourierError) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.failure,
            Slot::MessageProcessingFailure,
            Arc::new(handler),
        )
    }

    pub fn on_message_serialization_error(
        &self,
        handler: impl Fn(&CurrentMessageInformation, &CourierError) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.serialization_error,
            Slot::MessageSerializationError,
            Arc::new(handler),
        )
    }

    pub fn on_message_sent(
        &self,
        handler: impl Fn(&SentMessageInformation) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(&self.inner.sent, Slot::MessageSent, Arc::new(handler))
    }

    pub fn on_before_message_transaction_commit(
        &self,
        handler: impl Fn(&CurrentMessageInformation) -> CourierResult<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            &self.inner.before_commit,
            Slot::BeforeMessageTransactionCommit,
            Arc::new(handler),
        )
    }

    /// Install the failure policy consulted before the failure fan-out.
    /// The transport wires the error action here during start.
    pub(crate) fn set_failure_policy(
        &self,
        policy: impl Fn(&CurrentMessageInformation, &CourierError) -> FailureDisposition
            + Send
            + Sync
            + 'static,
    ) {
        *self
            .inner
            .failure_policy
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(policy));
    }

    /// Remove a subscriber; safe while the transport is running
    pub fn unsubscribe(&self, subscription: Subscription) {
        match subscription.slot {
            Slot::Started => remove(&self.inner.started, subscription.id),
            Slot::MessageArrived => remove(&self.inner.message_arrived, subscription.id),
            Slot::AdministrativeMessageArrived => {
                remove(&self.inner.admin_arrived, subscription.id)
            }
            Slot::MessageProcessingCompleted => remove(&self.inner.completed, subscription.id),
            Slot::AdministrativeMessageProcessingCompleted => {
                remove(&self.inner.admin_completed, subscription.id)
            }
            Slot::MessageProcessingFailure => remove(&self.inner.failure, subscription.id),
            Slot::MessageSerializationError => {
                remove(&self.inner.serialization_error, subscription.id)
            }
            Slot::MessageSent => remove(&self.inner.sent, subscription.id),
            Slot::BeforeMessageTransactionCommit => {
                remove(&self.inner.before_commit, subscription.id)
            }
        }
    }

    // =========================================================================
    // Dispatch surface
    // =========================================================================

    pub(crate) fn notify_started(&self) {
        for handler in snapshot(&self.inner.started) {
            handler();
        }
    }

    /// Fan out an arrival, folding consumer verdicts with logical OR.
    /// The first handler error aborts the fan-out and fails the dispatch.
    pub(crate) fn notify_arrival(
        &self,
        administrative: bool,
        info: &CurrentMessageInformation,
    ) -> CourierResult<bool> {
        let handlers = if administrative {
            snapshot(&self.inner.admin_arrived)
        } else {
            snapshot(&self.inner.message_arrived)
        };

        let mut consumed = false;
        for handler in handlers {
            consumed |= handler(info)?;
        }
        Ok(consumed)
    }

    /// Invoke the pre-commit hooks; the first error fails the dispatch
    pub(crate) fn notify_before_commit(
        &self,
        info: &CurrentMessageInformation,
    ) -> CourierResult<()> {
        for handler in snapshot(&self.inner.before_commit) {
            handler(info)?;
        }
        Ok(())
    }

    pub(crate) fn notify_completed(
        &self,
        administrative: bool,
        info: &CurrentMessageInformation,
        error: Option<&CourierError>,
    ) {
        let handlers = if administrative {
            snapshot(&self.inner.admin_completed)
        } else {
            snapshot(&self.inner.completed)
        };
        for handler in handlers {
            handler(info, error);
        }
    }

    /// Consult the failure policy, then fan the failure out to observers
    pub(crate) fn notify_failure(
        &self,
        info: &CurrentMessageInformation,
        error: &CourierError,
    ) -> FailureDisposition {
        let policy = self
            .inner
            .failure_policy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let disposition = match policy {
            Some(policy) => policy(info, error),
            None => FailureDisposition::Retry,
        };

        for handler in snapshot(&self.inner.failure) {
            handler(info, error);
        }
        disposition
    }

    pub(crate) fn notify_serialization_error(
        &self,
        info: &CurrentMessageInformation,
        error: &CourierError,
    ) {
        for handler in snapshot(&self.inner.serialization_error) {
            handler(info, error);
        }
    }

    pub(crate) fn notify_sent(&self, info: &SentMessageInformation) {
        for handler in snapshot(&self.inner.sent) {
            handler(info);
        }
    }
}
