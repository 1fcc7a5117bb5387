//! The audit (logging) module.
//!
//! Subscribes to arrival, completion, failure, send, and
//! serialization-fault events and mirrors each as a typed record on a
//! dedicated administrative queue. Failure records are written under their
//! own single-message transaction, distinct from the dispatch transaction,
//! so the audit survives even when the dispatch aborts; the other records
//! are written best-effort via normal enqueue.
//!
//! Every record carries an `audit_id` GUID as the deduplication key for
//! the audit stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_queue::{QueueEngine, QueueMessage, QueueName, TransactionOptions};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::CourierResult;
use crate::events::EventBus;
use crate::message::{stamp_outbound, MessageKind};
use crate::serializer::LogicalMessage;

/// A typed audit record mirrored onto the log queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    MessageArrived {
        audit_id: Uuid,
        message_id: Uuid,
        source: Option<String>,
        message: Option<LogicalMessage>,
        arrived_at: DateTime<Utc>,
    },
    MessageProcessingCompleted {
        audit_id: Uuid,
        message_id: Uuid,
        source: Option<String>,
        message_type: Option<String>,
        completed_at: DateTime<Utc>,
        /// Milliseconds between the recorded arrival and now; absent when
        /// no arrival was observed for the message
        duration_ms: Option<u64>,
    },
    MessageProcessingFailed {
        audit_id: Uuid,
        message_id: Uuid,
        source: Option<String>,
        message_type: Option<String>,
        error: String,
        message: Option<LogicalMessage>,
        failed_at: DateTime<Utc>,
    },
    MessageSent {
        audit_id: Uuid,
        message_id: Uuid,
        source: String,
        destination: String,
        messages: Vec<LogicalMessage>,
        message_type: Option<String>,
        sent_at: DateTime<Utc>,
    },
    MessageSerializationFault {
        audit_id: Uuid,
        message_id: Uuid,
        source: Option<String>,
        error: String,
        occurred_at: DateTime<Utc>,
    },
}

impl AuditRecord {
    /// The deduplication key of this record
    pub fn audit_id(&self) -> Uuid {
        match self {
            Self::MessageArrived { audit_id, .. }
            | Self::MessageProcessingCompleted { audit_id, .. }
            | Self::MessageProcessingFailed { audit_id, .. }
            | Self::MessageSent { audit_id, .. }
            | Self::MessageSerializationFault { audit_id, .. } => *audit_id,
        }
    }
}

struct AuditInner {
    engine: QueueEngine,
    queue: QueueName,
    local: Endpoint,
    options: TransactionOptions,
    /// Arrival timestamps per wire-level message id, consumed on completion
    arrivals: DashMap<u64, DateTime<Utc>>,
}

impl AuditInner {
    fn build_message(&self, record: &AuditRecord) -> CourierResult<QueueMessage> {
        let body = serde_json::to_vec(record)
            .map_err(crate::error::CourierError::serialization)?;
        Ok(QueueMessage::new(
            stamp_outbound(record.audit_id(), MessageKind::Ordinary, &self.local),
            body,
        ))
    }

    /// Best-effort write via normal enqueue
    fn write_direct(&self, record: AuditRecord) {
        let outcome = self
            .build_message(&record)
            .and_then(|m| self.engine.send_direct(&self.queue, m).map_err(Into::into));
        if let Err(e) = outcome {
            warn!(queue = %self.queue, error = %e, "failed to write audit record");
        }
    }

    /// Durable write under a single-message transaction of its own
    fn write_transactional(&self, record: AuditRecord) {
        let outcome = self.build_message(&record).and_then(|m| {
            let mut tx = self.engine.begin(self.options)?;
            tx.send(&self.queue, m)?;
            tx.commit()?;
            Ok(())
        });
        if let Err(e) = outcome {
            warn!(queue = %self.queue, error = %e, "failed to write audit failure record");
        }
    }
}

/// Mirrors transport lifecycle events onto an administrative queue
pub(crate) struct AuditModule;

impl AuditModule {
    /// Open the log queue and subscribe to the lifecycle events
    pub(crate) fn install(
        engine: QueueEngine,
        queue: QueueName,
        local: Endpoint,
        options: TransactionOptions,
        bus: &EventBus,
    ) -> CourierResult<()> {
        engine.ensure_queue(&queue)?;
        let inner = Arc::new(AuditInner {
            engine,
            queue,
            local,
            options,
            arrivals: DashMap::new(),
        });

        {
            let inner = Arc::clone(&inner);
            bus.on_message_arrived(move |info| {
                let arrived_at = Utc::now();
                inner.arrivals.insert(info.transport_message_id, arrived_at);
                inner.write_direct(AuditRecord::MessageArrived {
                    audit_id: Uuid::new_v4(),
                    message_id: info.message_id,
                    source: info.source.as_ref().map(Endpoint::uri),
                    message: info.current_message.clone(),
                    arrived_at,
                });
                // Observes without consuming
                Ok(false)
            });
        }

        {
            let inner = Arc::clone(&inner);
            bus.on_message_processing_completed(move |info, _error| {
                let completed_at = Utc::now();
                let arrived_at = inner
                    .arrivals
                    .remove(&info.transport_message_id)
                    .map(|(_, at)| at);
                let duration_ms = arrived_at
                    .map(|at| (completed_at - at).num_milliseconds().max(0) as u64);
                inner.write_direct(AuditRecord::MessageProcessingCompleted {
                    audit_id: Uuid::new_v4(),
                    message_id: info.message_id,
                    source: info.source.as_ref().map(Endpoint::uri),
                    message_type: info
                        .current_message
                        .as_ref()
                        .map(|m| m.type_name.clone()),
                    completed_at,
                    duration_ms,
                });
            });
        }

        {
            let inner = Arc::clone(&inner);
            bus.on_message_processing_failure(move |info, error| {
                inner.write_transactional(AuditRecord::MessageProcessingFailed {
                    audit_id: Uuid::new_v4(),
                    message_id: info.message_id,
                    source: info.source.as_ref().map(Endpoint::uri),
                    message_type: info
                        .current_message
                        .as_ref()
                        .map(|m| m.type_name.clone()),
                    error: error.to_string(),
                    message: info.current_message.clone(),
                    failed_at: Utc::now(),
                });
            });
        }

        {
            let inner = Arc::clone(&inner);
            bus.on_message_sent(move |sent| {
                inner.write_direct(AuditRecord::MessageSent {
                    audit_id: Uuid::new_v4(),
                    message_id: sent.message_id,
                    source: sent.source.uri(),
                    destination: sent.destination.uri(),
                    messages: sent.messages.clone(),
                    message_type: sent.messages.first().map(|m| m.type_name.clone()),
                    sent_at: sent.sent_at,
                });
            });
        }

        {
            let inner = Arc::clone(&inner);
            bus.on_message_serialization_error(move |info, error| {
                inner.write_direct(AuditRecord::MessageSerializationFault {
                    audit_id: Uuid::new_v4(),
                    message_id: info.message_id,
                    source: info.source.as_ref().map(Endpoint::uri),
                    error: error.to_string(),
                    occurred_at: Utc::now(),
                });
            });
        }

        Ok(())
    }
}
