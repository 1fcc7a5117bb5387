//! Queue engine error taxonomy.
//!
//! The transport's worker loop keys its control flow off these variants:
//! [`QueueError::Timeout`] is benign (keep looping), [`QueueError::Closed`]
//! means tear-down (exit quietly), anything else is a fault that deserves
//! operator attention.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by queue engine operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// No message became available within the wait budget
    #[error("timed out waiting for a message on '{queue}'")]
    Timeout { queue: String },

    /// The engine is shutting down or already closed
    #[error("queue engine is shutting down")]
    Closed,

    /// The named queue was never created on this engine
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    /// Queue name failed validation
    #[error("invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    /// The transaction outlived its configured budget before commit
    #[error("transaction exceeded its {timeout:?} budget")]
    TransactionTimedOut { timeout: Duration },

    /// A specific message was requested but is no longer in the queue
    #[error("message {id} is no longer available in '{queue}'")]
    MessageGone { queue: String, id: u64 },

    /// Tear-down was requested while transactions are still in flight
    #[error("{count} transactions still in flight")]
    Busy { count: usize },

    /// Catch-all for provider faults that have no dedicated variant
    #[error("queue engine fault: {0}")]
    Engine(String),
}

impl QueueError {
    pub fn timeout(queue: impl Into<String>) -> Self {
        Self::Timeout {
            queue: queue.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine(reason.into())
    }

    /// True for the benign wait-expired case the consumer loop should ignore
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the engine is tearing down and consumers should exit
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
