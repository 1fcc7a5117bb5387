//! The worker loop.
//!
//! Each worker repeats peek → receive-under-transaction → classify →
//! dispatch while the run flag is set. Peek-then-receive matters because
//! the engine binds dequeue visibility to transaction commit; a bare
//! receive would need double-buffering to avoid losing a message on a
//! crash.
//!
//! Loop exits: a cleared run flag, engine tear-down, or a fatal queue
//! fault. Wait timeouts are benign and dispatch errors never unwind past
//! the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_queue::{QueueEngine, QueueMessage, QueueName, TransactionOptions, SUBQUEUE_TIMEOUT};
use tracing::{debug, error, warn};

use crate::dispatcher::{DispatchKind, Dispatcher};
use crate::error::CourierResult;
use crate::message::{MessageKind, TransportMessageExt};
use crate::stats::TransportStatistics;
use crate::timeout::TimeoutScheduler;

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) engine: QueueEngine,
    pub(crate) queue: QueueName,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) scheduler: Arc<TimeoutScheduler>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) options: TransactionOptions,
    pub(crate) peek_timeout: Duration,
    pub(crate) receive_timeout: Duration,
    pub(crate) stats: Arc<TransportStatistics>,
}

impl Worker {
    pub(crate) async fn run(self) {
        debug!(worker = self.id, queue = %self.queue, "worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.engine.peek(&self.queue, self.peek_timeout).await {
                Ok(_) => {}
                Err(e) if e.is_timeout() => continue,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    error!(worker = self.id, error = %e, "queue fault while peeking");
                    break;
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let mut tx = match self.engine.begin(self.options) {
                Ok(tx) => tx,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    error!(worker = self.id, error = %e, "could not open a transaction");
                    break;
                }
            };

            let message = match self
                .engine
                .receive(&mut tx, &self.queue, self.receive_timeout)
                .await
            {
                Ok(message) => message,
                // A peer worker won the peeked message
                Err(e) if e.is_timeout() => continue,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    error!(worker = self.id, error = %e, "queue fault while receiving");
                    break;
                }
            };

            if let Err(e) = self.handle(message, tx) {
                error!(worker = self.id, error = %e, "dispatch failed; continuing");
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    /// Classify the received message by its kind marker and route it
    fn handle(
        &self,
        message: QueueMessage,
        mut tx: courier_queue::QueueTransaction,
    ) -> CourierResult<()> {
        match message.kind() {
            MessageKind::Administrative => {
                self.dispatcher
                    .dispatch(message, tx, DispatchKind::Administrative);
                Ok(())
            }
            MessageKind::Shutdown => {
                // Consumed without dispatch
                tx.commit()?;
                Ok(())
            }
            MessageKind::Timeout => {
                match message.time_to_send() {
                    Ok(Some(due)) if due > Utc::now() => {
                        let parked = self.queue.with_subqueue(SUBQUEUE_TIMEOUT)?;
                        tx.divert_received(message.local_id, &parked)?;
                        tx.commit()?;
                        // Registered only after the park committed, so the
                        // scheduler never chases a message that is not there
                        self.scheduler
                            .register(due, message.local_id, message.message_id());
                        self.stats.record_deferred();
                        Ok(())
                    }
                    Ok(_) => {
                        // Send time already passed, or was never stamped
                        self.dispatcher.dispatch(message, tx, DispatchKind::Ordinary);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(
                            worker = self.id,
                            message_id = %message.message_id(),
                            error = %e,
                            "unparseable time-to-send; delivering immediately"
                        );
                        self.dispatcher.dispatch(message, tx, DispatchKind::Ordinary);
                        Ok(())
                    }
                }
            }
            // The sender's header stamp decides routing; everything else is
            // ordinary, loadbalancer included
            MessageKind::Ordinary | MessageKind::LoadBalancer => {
                self.dispatcher.dispatch(message, tx, DispatchKind::Ordinary);
                Ok(())
            }
        }
    }
}
