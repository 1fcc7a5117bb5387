//! The transport facade.
//!
//! [`QueueTransport`] owns the queue engine, the event bus, the worker
//! pool, the timeout scheduler, the error action, and the audit module,
//! and exposes the lifecycle surface: `start`, `shutdown`, `send`,
//! `send_at`, `reply`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_queue::{
    QueueEngine, QueueError, QueueMessage, QueueName, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS,
    SUBQUEUE_TIMEOUT,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditModule;
use crate::config::TransportConfig;
use crate::context::{self, SentMessageInformation};
use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};
use crate::events::EventBus;
use crate::message::{format_time_to_send, headers, stamp_outbound, MessageKind};
use crate::retry::ErrorAction;
use crate::serializer::{LogicalMessage, MessageSerializer};
use crate::stats::{StatisticsSnapshot, TransportStatistics};
use crate::timeout::TimeoutScheduler;
use crate::worker::Worker;

/// Attempts to close the queue engine before forcing tear-down
const QUEUE_CLOSE_ATTEMPTS: usize = 5;

/// Backoff between close attempts, yielding to in-flight workers
const QUEUE_CLOSE_BACKOFF: Duration = Duration::from_millis(50);

/// A durable, transactional message-bus transport endpoint
pub struct QueueTransport {
    config: TransportConfig,
    local: Endpoint,
    engine: QueueEngine,
    serializer: MessageSerializer,
    bus: EventBus,
    stats: Arc<TransportStatistics>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    scheduler: Mutex<Option<Arc<TimeoutScheduler>>>,
}

impl QueueTransport {
    /// Build a transport backed by a fresh in-process engine and the JSON
    /// serializer
    pub fn new(config: TransportConfig) -> CourierResult<Self> {
        Self::with_engine(config, QueueEngine::in_memory(), MessageSerializer::json())
    }

    /// Build a transport over an injected engine and serializer.
    ///
    /// Sharing one engine between transports gives loopback delivery
    /// between their endpoints.
    pub fn with_engine(
        config: TransportConfig,
        engine: QueueEngine,
        serializer: MessageSerializer,
    ) -> CourierResult<Self> {
        let local = config.endpoint()?;
        Ok(Self {
            config,
            local,
            engine,
            serializer,
            bus: EventBus::new(),
            stats: Arc::new(TransportStatistics::default()),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            scheduler: Mutex::new(None),
        })
    }

    /// Start the transport: create the queue and its sub-queues, wire the
    /// error action and the audit module, start the timeout scheduler,
    /// spawn the workers, fire `Started`.
    ///
    /// A transport starts once; a second call fails.
    pub async fn start(&self) -> CourierResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CourierError::AlreadyStarted);
        }

        let queue = self.local.queue_name().as_main();
        self.engine.ensure_queue(&queue)?;
        for sub in [SUBQUEUE_TIMEOUT, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS] {
            self.engine.ensure_queue(&queue.with_subqueue(sub)?)?;
        }

        ErrorAction::new(self.config.number_of_retries).install(&self.bus);

        if let Some(audit_queue) = &self.config.audit_queue {
            AuditModule::install(
                self.engine.clone(),
                QueueName::main(audit_queue.clone())?,
                self.local.clone(),
                self.config.transaction_options(),
                &self.bus,
            )?;
        }

        let scheduler = Arc::new(TimeoutScheduler::new(
            self.engine.clone(),
            queue.clone(),
            self.config.transaction_options(),
        )?);
        scheduler.start(self.config.scheduler_tick());
        *self
            .scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&scheduler));

        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Arc::new(Dispatcher::new(
            self.serializer.clone(),
            self.bus.clone(),
            self.local.clone(),
            Arc::clone(&self.stats),
        ));

        let worker_count = self.config.worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = Worker {
                id,
                engine: self.engine.clone(),
                queue: queue.clone(),
                dispatcher: Arc::clone(&dispatcher),
                scheduler: Arc::clone(&scheduler),
                running: Arc::clone(&self.running),
                options: self.config.transaction_options(),
                peek_timeout: self.config.peek_timeout(),
                receive_timeout: self.config.receive_timeout(),
                stats: Arc::clone(&self.stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        *self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = handles;

        info!(
            endpoint = %self.local,
            workers = worker_count,
            engine = self.engine.provider_name(),
            "transport started"
        );
        self.bus.notify_started();
        Ok(())
    }

    /// Stop the transport: clear the run flag, stop the scheduler, close
    /// the engine (retrying to yield to in-flight workers), join the
    /// workers.
    ///
    /// Each worker finishes at most one in-flight dispatch; its
    /// transaction commits or rolls back in full.
    pub async fn shutdown(&self) -> CourierResult<()> {
        self.running.store(false, Ordering::SeqCst);

        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        let mut closed = false;
        for attempt in 1..=QUEUE_CLOSE_ATTEMPTS {
            match self.engine.close() {
                Ok(()) => {
                    closed = true;
                    break;
                }
                Err(QueueError::Busy { count }) => {
                    debug!(attempt, count, "waiting for in-flight transactions");
                    tokio::time::sleep(QUEUE_CLOSE_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, "queue engine close failed");
                    break;
                }
            }
        }
        if !closed {
            self.engine.force_close();
        }

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for handle in handles {
            let _ = handle.await;
        }

        info!(endpoint = %self.local, "transport stopped");
        Ok(())
    }

    /// Send a logical message sequence to a destination endpoint.
    ///
    /// The enqueue is transactional; `MessageSent` fires best-effort after
    /// the commit. Returns the assigned message id.
    pub async fn send(
        &self,
        destination: &Endpoint,
        messages: Vec<LogicalMessage>,
    ) -> CourierResult<Uuid> {
        self.send_with(destination, messages, |_| {}).await
    }

    /// Send a sequence whose delivery is deferred until `process_again_at`.
    ///
    /// The receiving transport parks it in the `timeout` sub-queue until
    /// the send time elapses.
    pub async fn send_at(
        &self,
        destination: &Endpoint,
        process_again_at: DateTime<Utc>,
        messages: Vec<LogicalMessage>,
    ) -> CourierResult<Uuid> {
        self.send_with(destination, messages, |message_headers| {
            message_headers.insert(
                headers::TIME_TO_SEND.to_string(),
                format_time_to_send(process_again_at),
            );
            message_headers.insert(
                headers::KIND.to_string(),
                MessageKind::Timeout.as_str().to_string(),
            );
        })
        .await
    }

    async fn send_with(
        &self,
        destination: &Endpoint,
        messages: Vec<LogicalMessage>,
        customize: impl FnOnce(&mut HashMap<String, String>),
    ) -> CourierResult<Uuid> {
        if messages.is_empty() {
            return Err(CourierError::EmptyPayload);
        }

        let message_id = Uuid::new_v4();
        let marker = messages[0].class.kind_marker();
        let body = self.serializer.serialize(&messages)?;
        let mut message_headers = stamp_outbound(message_id, marker, &self.local);
        customize(&mut message_headers);

        let mut tx = self.engine.begin(self.config.transaction_options())?;
        tx.send(
            destination.queue_name(),
            QueueMessage::new(message_headers, body),
        )?;
        tx.commit()?;

        self.stats.record_sent();
        self.bus.notify_sent(&SentMessageInformation {
            message_id,
            source: self.local.clone(),
            destination: destination.clone(),
            messages,
            sent_at: Utc::now(),
        });
        Ok(message_id)
    }

    /// Reply to the message currently being dispatched on this task.
    ///
    /// Only valid inside a subscriber callback; the reply is sent to the
    /// message's source inside the dispatch transaction.
    pub fn reply(&self, messages: Vec<LogicalMessage>) -> CourierResult<()> {
        context::stage_reply(messages)
    }

    /// The lifecycle event registry
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// This transport's endpoint
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// The backing queue engine
    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    /// Point-in-time transport counters
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Messages currently visible in the local queue or one of its
    /// sub-queues
    pub fn queue_len(&self, subqueue: Option<&str>) -> CourierResult<usize> {
        let queue = self.local.queue_name().as_main();
        let name = match subqueue {
            Some(sub) => queue.with_subqueue(sub)?,
            None => queue,
        };
        Ok(self.engine.queue_len(&name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportMessageExt;

    fn config(queue: &str) -> TransportConfig {
        TransportConfig::new(format!("courier://localhost/{queue}"))
    }

    #[tokio::test]
    async fn start_is_single_shot() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(CourierError::AlreadyStarted)
        ));
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_creates_the_subqueues() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        transport.start().await.unwrap();

        assert_eq!(transport.queue_len(None).unwrap(), 0);
        for sub in [SUBQUEUE_TIMEOUT, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS] {
            assert_eq!(transport.queue_len(Some(sub)).unwrap(), 0);
        }
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn send_stamps_the_reserved_headers() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        let destination = Endpoint::parse("courier://localhost/peer").unwrap();
        transport.engine().ensure_queue(destination.queue_name()).unwrap();

        let id = transport
            .send(&destination, vec![LogicalMessage::text("hi")])
            .await
            .unwrap();

        let sent = transport
            .engine()
            .peek(destination.queue_name(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(sent.message_id(), id);
        assert_eq!(sent.kind(), MessageKind::Ordinary);
        assert_eq!(
            sent.header(headers::SOURCE),
            Some("courier://localhost:2200/inbox")
        );
    }

    #[tokio::test]
    async fn send_at_forces_the_timeout_kind() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        let destination = Endpoint::parse("courier://localhost/peer").unwrap();
        transport.engine().ensure_queue(destination.queue_name()).unwrap();

        use chrono::Timelike;
        let due = Utc::now().with_nanosecond(500_000_000).unwrap() + chrono::Duration::seconds(30);
        transport
            .send_at(&destination, due, vec![LogicalMessage::text("later")])
            .await
            .unwrap();

        let sent = transport
            .engine()
            .peek(destination.queue_name(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(sent.kind(), MessageKind::Timeout);
        assert_eq!(sent.time_to_send().unwrap(), Some(due));
    }

    #[tokio::test]
    async fn administrative_first_element_sets_the_marker() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        let destination = Endpoint::parse("courier://localhost/peer").unwrap();
        transport.engine().ensure_queue(destination.queue_name()).unwrap();

        transport
            .send(
                &destination,
                vec![LogicalMessage::administrative(
                    "AddSubscription",
                    serde_json::json!({}),
                )],
            )
            .await
            .unwrap();

        let sent = transport
            .engine()
            .peek(destination.queue_name(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(sent.kind(), MessageKind::Administrative);
    }

    #[tokio::test]
    async fn empty_sends_are_rejected() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        let destination = Endpoint::parse("courier://localhost/peer").unwrap();
        assert!(matches!(
            transport.send(&destination, Vec::new()).await,
            Err(CourierError::EmptyPayload)
        ));
    }

    #[tokio::test]
    async fn reply_outside_a_dispatch_is_rejected() {
        let transport = QueueTransport::new(config("inbox")).unwrap();
        assert!(matches!(
            transport.reply(vec![LogicalMessage::text("pong")]),
            Err(CourierError::OutsideDispatch)
        ));
    }
}
