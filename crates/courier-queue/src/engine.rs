//! Enum dispatch for queue engine providers.
//!
//! Uses enum dispatch instead of `Arc<dyn …>` so provider calls stay
//! monomorphic and the transaction type stays concrete. The in-process
//! provider is the only variant today; durable providers slot in as new
//! variants without touching callers.

use std::time::Duration;

use crate::{
    MemoryQueueEngine, QueueError, QueueMessage, QueueName, QueueTransaction, TransactionOptions,
};

/// A queue engine provider
#[derive(Debug, Clone)]
pub enum QueueEngine {
    /// In-process engine with loopback delivery
    Memory(MemoryQueueEngine),
    // Future variants can be added as needed:
    // Persistent(PersistentQueueEngine),
}

impl QueueEngine {
    /// Create an in-process engine
    pub fn in_memory() -> Self {
        Self::Memory(MemoryQueueEngine::new())
    }

    /// Provider name for logging and diagnostics
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
        }
    }

    /// Create the queue if it does not exist yet; idempotent
    pub fn ensure_queue(&self, name: &QueueName) -> Result<(), QueueError> {
        match self {
            Self::Memory(e) => e.ensure_queue(name),
        }
    }

    /// Number of messages currently visible in the queue
    pub fn queue_len(&self, name: &QueueName) -> Result<usize, QueueError> {
        match self {
            Self::Memory(e) => e.queue_len(name),
        }
    }

    /// Open a transaction
    pub fn begin(&self, options: TransactionOptions) -> Result<QueueTransaction, QueueError> {
        match self {
            Self::Memory(e) => e.begin(options),
        }
    }

    /// Wait for a message to become visible without taking it
    pub async fn peek(
        &self,
        name: &QueueName,
        timeout: Duration,
    ) -> Result<QueueMessage, QueueError> {
        match self {
            Self::Memory(e) => e.peek(name, timeout).await,
        }
    }

    /// Take the head message inside `tx`, waiting up to `timeout`
    pub async fn receive(
        &self,
        tx: &mut QueueTransaction,
        name: &QueueName,
        timeout: Duration,
    ) -> Result<QueueMessage, QueueError> {
        match self {
            Self::Memory(e) => e.receive(tx, name, timeout).await,
        }
    }

    /// Take a specific message out of a queue inside `tx`
    pub fn take_by_id(
        &self,
        tx: &mut QueueTransaction,
        name: &QueueName,
        local_id: u64,
    ) -> Result<QueueMessage, QueueError> {
        match self {
            Self::Memory(e) => e.take_by_id(tx, name, local_id),
        }
    }

    /// Append a single message outside any transaction
    pub fn send_direct(
        &self,
        name: &QueueName,
        message: QueueMessage,
    ) -> Result<u64, QueueError> {
        match self {
            Self::Memory(e) => e.send_direct(name, message),
        }
    }

    /// Begin tear-down; refuses with [`QueueError::Busy`] while transactions
    /// are in flight
    pub fn close(&self) -> Result<(), QueueError> {
        match self {
            Self::Memory(e) => e.close(),
        }
    }

    /// Tear down regardless of in-flight transactions
    pub fn force_close(&self) {
        match self {
            Self::Memory(e) => e.force_close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Memory(e) => e.is_closed(),
        }
    }
}

impl From<MemoryQueueEngine> for QueueEngine {
    fn from(engine: MemoryQueueEngine) -> Self {
        Self::Memory(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name() {
        assert_eq!(QueueEngine::in_memory().provider_name(), "memory");
    }

    #[tokio::test]
    async fn engine_delegates_to_provider() {
        let engine = QueueEngine::in_memory();
        let name = QueueName::main("orders").unwrap();
        engine.ensure_queue(&name).unwrap();

        let mut tx = engine.begin(TransactionOptions::default()).unwrap();
        tx.send(
            &name,
            QueueMessage::new(Default::default(), b"hello".to_vec()),
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(engine.queue_len(&name).unwrap(), 1);
        let peeked = engine.peek(&name, Duration::from_millis(100)).await.unwrap();
        assert_eq!(peeked.body, b"hello");
    }
}
