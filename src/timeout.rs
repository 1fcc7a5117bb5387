//! The timeout scheduler.
//!
//! Tracks future-dated messages parked in the `timeout` sub-queue and moves
//! each back to the main queue once its send time elapses. A background
//! tick (granularity ≤ 1 s) inspects the head of a time-ordered heap; the
//! stored record is moved verbatim, so the original `id` and `retries`
//! headers survive re-injection. The scheduler is stopped before the queue
//! engine on shutdown.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_queue::{QueueEngine, QueueError, QueueName, TransactionOptions, SUBQUEUE_TIMEOUT};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One parked message awaiting its send time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PendingTimeout {
    due: DateTime<Utc>,
    local_id: u64,
    message_id: Uuid,
}

struct SchedulerInner {
    engine: QueueEngine,
    main_queue: QueueName,
    timeout_queue: QueueName,
    options: TransactionOptions,
    pending: Mutex<BinaryHeap<Reverse<PendingTimeout>>>,
}

struct SchedulerControl {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Moves due messages from the `timeout` sub-queue back to the main queue
pub(crate) struct TimeoutScheduler {
    inner: Arc<SchedulerInner>,
    control: Mutex<Option<SchedulerControl>>,
}

impl TimeoutScheduler {
    pub(crate) fn new(
        engine: QueueEngine,
        main_queue: QueueName,
        options: TransactionOptions,
    ) -> Result<Self, QueueError> {
        let timeout_queue = main_queue.with_subqueue(SUBQUEUE_TIMEOUT)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                engine,
                main_queue,
                timeout_queue,
                options,
                pending: Mutex::new(BinaryHeap::new()),
            }),
            control: Mutex::new(None),
        })
    }

    /// Spawn the background tick
    pub(crate) fn start(&self, tick: Duration) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => inner.drain_due(Utc::now()),
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("timeout scheduler stopped");
        });

        *self
            .control
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(SchedulerControl {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Track a message parked in the `timeout` sub-queue
    pub(crate) fn register(&self, due: DateTime<Utc>, local_id: u64, message_id: Uuid) {
        debug!(
            message_id = %message_id,
            %due,
            "registered deferred message"
        );
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Reverse(PendingTimeout {
                due,
                local_id,
                message_id,
            }));
    }

    /// Stop the background tick and wait for it to finish
    pub(crate) async fn stop(&self) {
        let control = self
            .control
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(control) = control {
            let _ = control.shutdown.send(true);
            let _ = control.handle.await;
        }
    }
}

impl SchedulerInner {
    /// Re-inject every entry whose send time has arrived
    fn drain_due(&self, now: DateTime<Utc>) {
        loop {
            let entry = {
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                match pending.peek() {
                    Some(Reverse(head)) if head.due <= now => pending.pop().map(|r| r.0),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            self.reinject(entry);
        }
    }

    fn reinject(&self, entry: PendingTimeout) {
        let mut tx = match self.engine.begin(self.options) {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "timeout scheduler could not open a transaction");
                return;
            }
        };

        match self
            .engine
            .take_by_id(&mut tx, &self.timeout_queue, entry.local_id)
        {
            Ok(_) => {}
            Err(QueueError::MessageGone { .. }) => {
                // Already consumed or moved by someone else; nothing to do
                debug!(message_id = %entry.message_id, "deferred message no longer parked");
                return;
            }
            Err(e) => {
                error!(
                    message_id = %entry.message_id,
                    error = %e,
                    "failed to pick up deferred message"
                );
                return;
            }
        }

        let result = tx
            .divert_received(entry.local_id, &self.main_queue)
            .and_then(|()| tx.commit());
        match result {
            Ok(()) => info!(
                message_id = %entry.message_id,
                due = %entry.due,
                "deferred message re-injected into the main queue"
            ),
            Err(e) => error!(
                message_id = %entry.message_id,
                error = %e,
                "failed to re-inject deferred message"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_queue::QueueMessage;
    use std::collections::HashMap;

    fn setup() -> (QueueEngine, QueueName, TimeoutScheduler) {
        let engine = QueueEngine::in_memory();
        let main = QueueName::main("inbox").unwrap();
        let parked = main.with_subqueue(SUBQUEUE_TIMEOUT).unwrap();
        engine.ensure_queue(&main).unwrap();
        engine.ensure_queue(&parked).unwrap();
        let scheduler =
            TimeoutScheduler::new(engine.clone(), main.clone(), TransactionOptions::default())
                .unwrap();
        (engine, main, scheduler)
    }

    fn park(engine: &QueueEngine, main: &QueueName, body: &str) -> u64 {
        let parked = main.with_subqueue(SUBQUEUE_TIMEOUT).unwrap();
        engine
            .send_direct(
                &parked,
                QueueMessage::new(HashMap::new(), body.as_bytes().to_vec()),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn due_entries_move_back_to_the_main_queue() {
        let (engine, main, scheduler) = setup();
        let local_id = park(&engine, &main, "later");
        let due = Utc::now() - chrono::Duration::seconds(1);
        scheduler.register(due, local_id, Uuid::new_v4());

        scheduler.inner.drain_due(Utc::now());

        assert_eq!(engine.queue_len(&main).unwrap(), 1);
        assert_eq!(
            engine
                .queue_len(&main.with_subqueue(SUBQUEUE_TIMEOUT).unwrap())
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn future_entries_stay_parked() {
        let (engine, main, scheduler) = setup();
        let local_id = park(&engine, &main, "later");
        scheduler.register(
            Utc::now() + chrono::Duration::seconds(60),
            local_id,
            Uuid::new_v4(),
        );

        scheduler.inner.drain_due(Utc::now());

        assert_eq!(engine.queue_len(&main).unwrap(), 0);
        assert_eq!(
            engine
                .queue_len(&main.with_subqueue(SUBQUEUE_TIMEOUT).unwrap())
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn entries_reinject_in_send_time_order() {
        let (engine, main, scheduler) = setup();
        let first = park(&engine, &main, "first");
        let second = park(&engine, &main, "second");
        let base = Utc::now() - chrono::Duration::seconds(10);
        // Registered out of order; the heap orders by send time
        scheduler.register(base + chrono::Duration::seconds(5), second, Uuid::new_v4());
        scheduler.register(base, first, Uuid::new_v4());

        scheduler.inner.drain_due(Utc::now());

        assert_eq!(engine.queue_len(&main).unwrap(), 2);
        let head = engine.peek(&main, Duration::from_millis(100)).await.unwrap();
        assert_eq!(head.body, b"first");
    }

    #[tokio::test]
    async fn vanished_entries_are_skipped() {
        let (engine, main, scheduler) = setup();
        scheduler.register(Utc::now() - chrono::Duration::seconds(1), 999, Uuid::new_v4());

        scheduler.inner.drain_due(Utc::now());
        assert_eq!(engine.queue_len(&main).unwrap(), 0);
    }

    #[tokio::test]
    async fn background_tick_drains_without_manual_calls() {
        let (engine, main, scheduler) = setup();
        let local_id = park(&engine, &main, "soon");
        scheduler.register(
            Utc::now() + chrono::Duration::milliseconds(50),
            local_id,
            Uuid::new_v4(),
        );

        scheduler.start(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert_eq!(engine.queue_len(&main).unwrap(), 1);
    }
}
