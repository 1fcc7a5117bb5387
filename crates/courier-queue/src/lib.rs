//! # Courier Queue
//!
//! Transactional local queue engine for the courier message bus.
//!
//! The transport layer treats the queue engine as an external collaborator
//! and talks to it through the surface exposed here:
//!
//! - **Named queues with sub-queues**: a durable queue (`orders`) owns logical
//!   partitions (`orders;subqueue=errors`) that messages can be moved between
//!   transactionally.
//! - **Commit-bound visibility**: a message received inside a
//!   [`QueueTransaction`] stays invisible to peer consumers and is removed
//!   from its queue only when the transaction commits. Dropping the handle
//!   without committing returns the message to the head of its queue.
//! - **Blocking peek/receive**: consumers park on a queue with a bounded
//!   timeout and are woken by arrivals or by engine tear-down.
//!
//! ## Providers
//!
//! [`QueueEngine`] uses enum dispatch rather than trait objects, so each
//! provider keeps concrete types and zero vtable overhead. The in-process
//! [`MemoryQueueEngine`] provider implements the full contract with loopback
//! delivery between local endpoints; page-level storage and the remote wire
//! protocol belong to heavier providers.

mod engine;
mod error;
mod memory;
mod message;
mod name;
mod transaction;

pub use engine::QueueEngine;
pub use error::QueueError;
pub use memory::MemoryQueueEngine;
pub use message::QueueMessage;
pub use name::{QueueName, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS, SUBQUEUE_TIMEOUT};
pub use transaction::{IsolationLevel, QueueTransaction, TransactionOptions};
