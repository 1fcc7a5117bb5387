//! In-process queue engine provider.
//!
//! Implements the full engine contract against process memory: named queues
//! with sub-queue partitions, commit-bound visibility, blocking peek/receive
//! with bounded waits, and loopback delivery (a send addressed to any queue
//! that exists on this engine lands in that queue). Crash recovery is the
//! concern of durable providers; this one backs tests and single-process
//! deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::{QueueError, QueueMessage, QueueName, QueueTransaction, TransactionOptions};

/// State shared across all clones of a [`MemoryQueueEngine`]
pub(crate) struct MemoryInner {
    pub(crate) queues: Mutex<HashMap<QueueName, VecDeque<QueueMessage>>>,
    pub(crate) next_id: AtomicU64,
    pub(crate) active_transactions: AtomicUsize,
    pub(crate) closed: AtomicBool,
    /// Wakes parked peek/receive calls on arrivals, rollbacks, and tear-down
    pub(crate) arrivals: Notify,
}

impl std::fmt::Debug for MemoryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInner")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field(
                "active_transactions",
                &self.active_transactions.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// In-process transactional queue engine
#[derive(Debug, Clone)]
pub struct MemoryQueueEngine {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryQueueEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                queues: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                active_transactions: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Create the queue if it does not exist yet; idempotent
    pub fn ensure_queue(&self, name: &QueueName) -> Result<(), QueueError> {
        self.check_open()?;
        let mut queues = self.lock_queues();
        queues.entry(name.clone()).or_default();
        Ok(())
    }

    /// Number of messages currently visible in the queue
    pub fn queue_len(&self, name: &QueueName) -> Result<usize, QueueError> {
        let queues = self.lock_queues();
        queues
            .get(name)
            .map(VecDeque::len)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Open a transaction against this engine
    pub fn begin(&self, options: TransactionOptions) -> Result<QueueTransaction, QueueError> {
        self.check_open()?;
        self.inner
            .active_transactions
            .fetch_add(1, Ordering::SeqCst);
        Ok(QueueTransaction::new(self.inner.clone(), options))
    }

    /// Wait for a message to become visible without taking it.
    ///
    /// Returns a clone of the head message; a peer consumer may still win
    /// the subsequent receive.
    pub async fn peek(
        &self,
        name: &QueueName,
        timeout: Duration,
    ) -> Result<QueueMessage, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            let notified = self.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let queues = self.lock_queues();
                match queues.get(name) {
                    None => return Err(QueueError::QueueNotFound(name.to_string())),
                    Some(q) => {
                        if let Some(front) = q.front() {
                            return Ok(front.clone());
                        }
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::timeout(name.to_string()));
            }
        }
    }

    /// Take the head message inside `tx`.
    ///
    /// The message leaves the visible queue immediately but is only
    /// consumed when the transaction commits; rollback returns it to the
    /// head. Waits up to `timeout` for a message to appear.
    pub async fn receive(
        &self,
        tx: &mut QueueTransaction,
        name: &QueueName,
        timeout: Duration,
    ) -> Result<QueueMessage, QueueError> {
        self.check_transaction(tx)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            let notified = self.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queues = self.lock_queues();
                match queues.get_mut(name) {
                    None => return Err(QueueError::QueueNotFound(name.to_string())),
                    Some(q) => {
                        if let Some(message) = q.pop_front() {
                            tx.stage_received(name.clone(), message.clone());
                            return Ok(message);
                        }
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::timeout(name.to_string()));
            }
        }
    }

    /// Take a specific message out of a queue inside `tx`
    pub fn take_by_id(
        &self,
        tx: &mut QueueTransaction,
        name: &QueueName,
        local_id: u64,
    ) -> Result<QueueMessage, QueueError> {
        self.check_transaction(tx)?;
        self.check_open()?;
        let mut queues = self.lock_queues();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        let position = queue.iter().position(|m| m.local_id == local_id);
        let message = position
            .and_then(|at| queue.remove(at))
            .ok_or_else(|| QueueError::MessageGone {
                queue: name.to_string(),
                id: local_id,
            })?;
        tx.stage_received(name.clone(), message.clone());
        Ok(message)
    }

    /// Append a single message outside any transaction; visible immediately
    pub fn send_direct(
        &self,
        name: &QueueName,
        mut message: QueueMessage,
    ) -> Result<u64, QueueError> {
        self.check_open()?;
        let mut queues = self.lock_queues();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        message.local_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = message.local_id;
        queue.push_back(message);
        self.inner.arrivals.notify_waiters();
        Ok(id)
    }

    /// Begin tear-down.
    ///
    /// Refuses with [`QueueError::Busy`] while transactions are in flight so
    /// the caller can yield and retry; in-flight transactions may still
    /// commit after the engine closes.
    pub fn close(&self) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let active = self.inner.active_transactions.load(Ordering::SeqCst);
        if active > 0 {
            return Err(QueueError::Busy { count: active });
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.arrivals.notify_waiters();
        debug!("memory queue engine closed");
        Ok(())
    }

    /// Tear down regardless of in-flight transactions
    pub fn force_close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.arrivals.notify_waiters();
        debug!("memory queue engine force-closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_transaction(&self, tx: &QueueTransaction) -> Result<(), QueueError> {
        if Arc::ptr_eq(tx.engine_inner(), &self.inner) {
            Ok(())
        } else {
            Err(QueueError::engine("transaction was opened on a different engine"))
        }
    }

    fn lock_queues(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<QueueName, VecDeque<QueueMessage>>> {
        self.inner.queues.lock().unwrap_or_else(|p| p.into_inner())
    }
}
