//! Runtime statistics for the transport.
//!
//! Atomic counters updated on the dispatch and send paths, with a snapshot
//! type for observability surfaces.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by the workers, the dispatcher, and the send path
#[derive(Debug, Default)]
pub struct TransportStatistics {
    processed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    poisoned: AtomicU64,
    deferred: AtomicU64,
    sent: AtomicU64,
}

impl TransportStatistics {
    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poisoned(&self) {
        self.poisoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of all counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time transport counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Dispatches that committed
    pub processed: u64,
    /// Dispatches that rolled back (including each retry attempt)
    pub failed: u64,
    /// Messages no consumer claimed, retained in `discarded`
    pub discarded: u64,
    /// Messages quarantined in `errors` after exhausting retries
    pub poisoned: u64,
    /// Future-dated messages parked in `timeout`
    pub deferred: u64,
    /// Outbound sends that committed
    pub sent: u64,
}
