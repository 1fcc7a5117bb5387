//! # Courier Bus
//!
//! A durable, transactional message-bus transport: the subsystem that moves
//! application messages between endpoints with at-least-once delivery,
//! local persistence, bounded retries, deferred (future-dated) delivery,
//! and a structured audit pipeline.
//!
//! ## Architecture
//!
//! ```text
//! QueueTransport
//!   ├── QueueEngine              <- transactional local queue + sub-queues
//!   ├── Worker pool (N tasks)    <- peek → receive-in-tx → classify → dispatch
//!   ├── Dispatcher               <- decode, fan out, commit-or-rollback
//!   ├── EventBus                 <- typed lifecycle slots, snapshot-on-read
//!   ├── ErrorAction              <- retry ledger, quarantine to `errors`
//!   ├── TimeoutScheduler         <- re-injects parked future-dated messages
//!   └── AuditModule              <- mirrors events onto an admin queue
//! ```
//!
//! Every inbound message has exactly one terminal fate per transaction:
//! consumed, discarded, errored, or deferred. A message leaves the main
//! queue if and only if its transaction commits.
//!
//! ## Example
//!
//! ```no_run
//! use courier_bus::{LogicalMessage, QueueTransport, TransportConfig};
//!
//! # async fn example() -> courier_bus::CourierResult<()> {
//! let config = TransportConfig::new("courier://localhost/orders")
//!     .with_worker_count(2)
//!     .with_number_of_retries(3);
//! let transport = QueueTransport::new(config)?;
//!
//! transport.events().on_message_arrived(|info| {
//!     println!("got {:?}", info.current_message);
//!     Ok(true)
//! });
//!
//! transport.start().await?;
//! let peer = "courier://localhost/orders".parse()?;
//! transport.send(&peer, vec![LogicalMessage::text("Hello")]).await?;
//! # transport.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod audit;
mod config;
mod context;
mod dispatcher;
mod endpoint;
mod error;
mod events;
mod message;
mod retry;
mod serializer;
mod stats;
mod timeout;
mod transport;
mod worker;

pub use audit::AuditRecord;
pub use config::TransportConfig;
pub use context::{current_message, CurrentMessageInformation, SentMessageInformation};
pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use error::{CourierError, CourierResult};
pub use events::{EventBus, FailureDisposition, Slot, Subscription};
pub use message::{
    format_time_to_send, headers, parse_time_to_send, MessageKind, TransportMessageExt,
};
pub use serializer::{LogicalMessage, MessageClass, MessageSerializer};
pub use stats::{StatisticsSnapshot, TransportStatistics};
pub use transport::QueueTransport;

// The queue engine contract, re-exported for callers that inject engines
// or inspect queues directly
pub use courier_queue::{
    IsolationLevel, MemoryQueueEngine, QueueEngine, QueueError, QueueMessage, QueueName,
    QueueTransaction, TransactionOptions, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS, SUBQUEUE_TIMEOUT,
};
