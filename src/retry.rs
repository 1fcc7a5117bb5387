//! The error action.
//!
//! Installed as the failure policy so it observes every failure before any
//! other subscriber. It keeps a per-message retry ledger; once a message
//! has failed `max_retries` times its verdict switches to
//! [`FailureDisposition::Poison`] and the dispatcher quarantines it in the
//! `errors` sub-queue with the final count stamped in the `retries` header.
//!
//! A rolled-back dispatch cannot mutate the stored message, so the live
//! count lives here rather than on the wire; the header is stamped on the
//! quarantined copy.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::CurrentMessageInformation;
use crate::error::CourierError;
use crate::events::{EventBus, FailureDisposition};

pub(crate) struct ErrorAction {
    max_retries: u32,
    attempts: DashMap<Uuid, u32>,
}

impl ErrorAction {
    pub(crate) fn new(max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            max_retries,
            attempts: DashMap::new(),
        })
    }

    /// Wire this action into the bus: the failure-policy slot plus a
    /// completion hook that clears the ledger once a message succeeds
    pub(crate) fn install(self: &Arc<Self>, bus: &EventBus) {
        let action = Arc::clone(self);
        bus.set_failure_policy(move |info, error| action.on_failure(info, error));

        let action = Arc::clone(self);
        bus.on_message_processing_completed(move |info, error| {
            if error.is_none() {
                action.attempts.remove(&info.message_id);
            }
        });
    }

    fn on_failure(
        &self,
        info: &CurrentMessageInformation,
        error: &CourierError,
    ) -> FailureDisposition {
        let attempts = {
            let mut entry = self.attempts.entry(info.message_id).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempts >= self.max_retries {
            self.attempts.remove(&info.message_id);
            warn!(
                message_id = %info.message_id,
                attempts,
                error = %error,
                "message exhausted its retries"
            );
            FailureDisposition::Poison { retries: attempts }
        } else {
            debug!(
                message_id = %info.message_id,
                attempts,
                max_retries = self.max_retries,
                "dispatch failed; message will be retried"
            );
            FailureDisposition::Retry
        }
    }
}
