//! Transport configuration.
//!
//! Serde-backed structs with field-level defaults, loadable from TOML
//! files layered with `COURIER_`-prefixed environment variables. Durations
//! are configured in seconds or milliseconds and exposed as
//! [`Duration`](std::time::Duration) through accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_queue::{IsolationLevel, TransactionOptions};
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};

/// Configured options of a transport endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local endpoint URI; determines the listen location and queue name
    pub endpoint: String,

    /// Number of workers draining the local queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// On-disk directory for persistent queue engines; unused by the
    /// in-process engine
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Default isolation for transport transactions
    #[serde(default)]
    pub isolation_level: IsolationLevel,

    /// Failures tolerated per message before it is quarantined
    #[serde(default = "default_number_of_retries")]
    pub number_of_retries: u32,

    /// Transaction budget between begin and commit
    #[serde(default = "default_transaction_timeout_seconds")]
    pub transaction_timeout_seconds: u64,

    /// Internal wait used when workers peek the queue
    #[serde(default = "default_peek_timeout_ms")]
    pub peek_timeout_ms: u64,

    /// Wait used when receiving a peeked message under a transaction
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Timeout scheduler polling granularity
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// Queue receiving audit records; auditing is off when absent
    #[serde(default)]
    pub audit_queue: Option<String>,
}

fn default_worker_count() -> usize {
    1
}

fn default_number_of_retries() -> u32 {
    5
}

fn default_transaction_timeout_seconds() -> u64 {
    30
}

fn default_peek_timeout_ms() -> u64 {
    1_000
}

fn default_receive_timeout_ms() -> u64 {
    1_000
}

fn default_scheduler_tick_ms() -> u64 {
    500
}

impl TransportConfig {
    /// A configuration with defaults for everything but the endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            worker_count: default_worker_count(),
            path: None,
            isolation_level: IsolationLevel::default(),
            number_of_retries: default_number_of_retries(),
            transaction_timeout_seconds: default_transaction_timeout_seconds(),
            peek_timeout_ms: default_peek_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            audit_queue: None,
        }
    }

    /// Load from a TOML file, layered with `COURIER_`-prefixed environment
    /// variables
    pub fn from_file(path: impl AsRef<Path>) -> CourierResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("COURIER"))
            .build()
            .map_err(CourierError::configuration)?;
        settings
            .try_deserialize()
            .map_err(CourierError::configuration)
    }

    /// Load from `COURIER_`-prefixed environment variables alone
    pub fn from_env() -> CourierResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("COURIER"))
            .build()
            .map_err(CourierError::configuration)?;
        settings
            .try_deserialize()
            .map_err(CourierError::configuration)
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_number_of_retries(mut self, number_of_retries: u32) -> Self {
        self.number_of_retries = number_of_retries;
        self
    }

    pub fn with_audit_queue(mut self, audit_queue: impl Into<String>) -> Self {
        self.audit_queue = Some(audit_queue.into());
        self
    }

    /// The parsed local endpoint
    pub fn endpoint(&self) -> CourierResult<Endpoint> {
        Endpoint::parse(&self.endpoint)
    }

    /// Options applied to every transaction the transport opens
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation: self.isolation_level,
            timeout: Duration::from_secs(self.transaction_timeout_seconds),
        }
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}
