//! Queue and sub-queue naming.
//!
//! A durable queue owns logical partitions addressed by a reserved suffix:
//! `orders` is the main queue, `orders;subqueue=errors` one of its
//! sub-queues. Moving a message between partitions is a transactional
//! operation on the engine, not a copy.

use std::fmt;
use std::str::FromStr;

use crate::QueueError;

/// Sub-queue holding future-dated messages until their send time elapses
pub const SUBQUEUE_TIMEOUT: &str = "timeout";

/// Sub-queue retaining messages no consumer claimed, for audit
pub const SUBQUEUE_DISCARDED: &str = "discarded";

/// Sub-queue quarantining messages that exhausted their retries
pub const SUBQUEUE_ERRORS: &str = "errors";

/// Reserved suffix that addresses a sub-queue inside a queue URI or name
const SUBQUEUE_SEPARATOR: &str = ";subqueue=";

/// Maximum accepted queue name length
const MAX_QUEUE_NAME_LEN: usize = 128;

/// A validated queue name, optionally addressing one of its sub-queues
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    queue: String,
    subqueue: Option<String>,
}

impl QueueName {
    /// Name a main queue
    pub fn main(queue: impl Into<String>) -> Result<Self, QueueError> {
        let queue = queue.into();
        validate_segment(&queue)?;
        Ok(Self {
            queue,
            subqueue: None,
        })
    }

    /// Name a sub-queue of `queue`
    pub fn subqueue(
        queue: impl Into<String>,
        subqueue: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let queue = queue.into();
        let subqueue = subqueue.into();
        validate_segment(&queue)?;
        validate_segment(&subqueue)?;
        Ok(Self {
            queue,
            subqueue: Some(subqueue),
        })
    }

    /// Address a sub-queue of this queue, dropping any current sub-queue part
    pub fn with_subqueue(&self, subqueue: &str) -> Result<Self, QueueError> {
        Self::subqueue(self.queue.clone(), subqueue)
    }

    /// The main queue this name belongs to
    pub fn as_main(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            subqueue: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subqueue_name(&self) -> Option<&str> {
        self.subqueue.as_deref()
    }

    pub fn is_subqueue(&self) -> bool {
        self.subqueue.is_some()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subqueue {
            Some(sub) => write!(f, "{}{}{}", self.queue, SUBQUEUE_SEPARATOR, sub),
            None => f.write_str(&self.queue),
        }
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(SUBQUEUE_SEPARATOR) {
            Some((queue, sub)) => Self::subqueue(queue, sub),
            None => Self::main(s),
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), QueueError> {
    if segment.is_empty() {
        return Err(QueueError::invalid_name(segment, "name is empty"));
    }
    if segment.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::invalid_name(
            segment,
            format!("name exceeds {MAX_QUEUE_NAME_LEN} characters"),
        ));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(QueueError::invalid_name(
            segment,
            "only ASCII alphanumerics, '_', '-' and '.' are allowed",
        ));
    }
    Ok(())
}
