//! Explicit transaction handle.
//!
//! Receives, sends, and sub-queue diversions are staged on the handle and
//! applied atomically by [`QueueTransaction::commit`]. Dropping the handle
//! without committing rolls everything back: received messages return to the
//! head of their queue, staged sends never become visible.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::memory::MemoryInner;
use crate::{QueueError, QueueMessage, QueueName};

/// Isolation level requested for a queue transaction.
///
/// The in-process engine serializes all state behind one lock, so every
/// level is honored trivially; the value is recorded so heavier providers
/// can map it onto their storage engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

/// Options applied to every transaction a transport opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    /// Budget between `begin` and `commit`; exceeding it fails the commit
    pub timeout: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// A message popped inside a transaction, awaiting its terminal fate
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) origin: QueueName,
    pub(crate) message: QueueMessage,
    /// When set, commit appends the message here instead of consuming it
    pub(crate) divert_to: Option<QueueName>,
}

/// A unit of work against the queue engine.
///
/// All staged operations either apply together on [`commit`](Self::commit)
/// or not at all when the handle is dropped.
#[derive(Debug)]
pub struct QueueTransaction {
    inner: Arc<MemoryInner>,
    options: TransactionOptions,
    started: Instant,
    pub(crate) received: Vec<ReceivedMessage>,
    pending_sends: Vec<(QueueName, QueueMessage)>,
    finished: bool,
}

impl QueueTransaction {
    pub(crate) fn new(inner: Arc<MemoryInner>, options: TransactionOptions) -> Self {
        Self {
            inner,
            options,
            started: Instant::now(),
            received: Vec::new(),
            pending_sends: Vec::new(),
            finished: false,
        }
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub(crate) fn engine_inner(&self) -> &Arc<MemoryInner> {
        &self.inner
    }

    pub(crate) fn stage_received(&mut self, origin: QueueName, message: QueueMessage) {
        self.received.push(ReceivedMessage {
            origin,
            message,
            divert_to: None,
        });
    }

    /// Stage an enqueue; the message becomes visible at commit
    pub fn send(
        &mut self,
        destination: &QueueName,
        message: QueueMessage,
    ) -> Result<(), QueueError> {
        self.ensure_destination(destination)?;
        self.pending_sends.push((destination.clone(), message));
        Ok(())
    }

    /// Re-target a received message: commit moves it to `destination`
    /// instead of consuming it. The engine-assigned id is preserved.
    pub fn divert_received(
        &mut self,
        local_id: u64,
        destination: &QueueName,
    ) -> Result<(), QueueError> {
        self.ensure_destination(destination)?;
        let received = self
            .received
            .iter_mut()
            .find(|r| r.message.local_id == local_id)
            .ok_or_else(|| QueueError::MessageGone {
                queue: destination.to_string(),
                id: local_id,
            })?;
        received.divert_to = Some(destination.clone());
        Ok(())
    }

    /// Mutable access to a received message's headers, for re-stamping
    /// before a diversion
    pub fn received_headers_mut(
        &mut self,
        local_id: u64,
    ) -> Option<&mut HashMap<String, String>> {
        self.received
            .iter_mut()
            .find(|r| r.message.local_id == local_id)
            .map(|r| &mut r.message.headers)
    }

    /// Apply every staged operation atomically.
    ///
    /// Fails with [`QueueError::TransactionTimedOut`] when the configured
    /// budget has elapsed; the transaction is rolled back in that case.
    pub fn commit(mut self) -> Result<(), QueueError> {
        if self.started.elapsed() > self.options.timeout {
            let timeout = self.options.timeout;
            self.rollback();
            self.finished = true;
            return Err(QueueError::TransactionTimedOut { timeout });
        }

        {
            let mut queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(|p| p.into_inner());

            for received in self.received.drain(..) {
                match received.divert_to {
                    Some(destination) => {
                        queues
                            .entry(destination)
                            .or_default()
                            .push_back(received.message);
                    }
                    None => trace!(
                        queue = %received.origin,
                        local_id = received.message.local_id,
                        "message consumed"
                    ),
                }
            }

            for (destination, mut message) in self.pending_sends.drain(..) {
                message.local_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                queues.entry(destination).or_default().push_back(message);
            }
        }

        self.inner.arrivals.notify_waiters();
        self.inner
            .active_transactions
            .fetch_sub(1, Ordering::SeqCst);
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) {
        {
            let mut queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(|p| p.into_inner());

            // Reverse order restores the original front-of-queue sequence
            for received in self.received.drain(..).rev() {
                queues
                    .entry(received.origin)
                    .or_default()
                    .push_front(received.message);
            }
        }
        self.pending_sends.clear();

        self.inner.arrivals.notify_waiters();
        self.inner
            .active_transactions
            .fetch_sub(1, Ordering::SeqCst);
    }

    fn ensure_destination(&self, destination: &QueueName) -> Result<(), QueueError> {
        let queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if queues.contains_key(destination) {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(destination.to_string()))
        }
    }
}

impl Drop for QueueTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}
