//! Priority queue (spec §4.1): three Redis streams, one per priority band,
//! each with its own consumer group so claims never cross priorities.

mod memory;
mod redis_queue;

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Categorizable, ErrorCategory};
use crate::types::{JobPriority, QueueMessage};

pub use memory::InMemoryPriorityQueue;
pub use redis_queue::RedisPriorityQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("message {0} has no stream id and cannot be acknowledged")]
    MissingMessageId(String),
    #[error("queue is empty")]
    Empty,
}

impl Categorizable for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(e) => e.category(),
            QueueError::MissingMessageId(_) => ErrorCategory::Validation,
            QueueError::Empty => ErrorCategory::NotFound,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            QueueError::Redis(_) => Cow::Borrowed("redis_error"),
            QueueError::MissingMessageId(_) => Cow::Borrowed("missing_message_id"),
            QueueError::Empty => Cow::Borrowed("queue_empty"),
        }
    }
}

/// A claimed message along with the stream it came from, so the caller can
/// ack/reclaim against the right stream+consumer group.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub stream: String,
    pub message: QueueMessage,
}

/// One pending (claimed-but-unacked) entry, as reported by `pending_detail`
/// (spec §4.1).
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub message_id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Abstraction over the priority-banded stream backend (spec §4.1).
///
/// Implementations must preserve the priority ordering: a `claim` call
/// drains `high` before `normal` before `low`, matching property 1.
#[async_trait]
pub trait PriorityQueue: Send + Sync {
    async fn enqueue(&self, msg: QueueMessage) -> Result<String, QueueError>;

    async fn claim(
        &self,
        consumer: &str,
        batch_size: usize,
    ) -> Result<Vec<Claimed>, QueueError>;

    async fn ack(&self, stream: &str, message_id: &str) -> Result<(), QueueError>;

    /// Reclaim messages pending longer than `min_idle` for this consumer
    /// group, making them visible to the next `claim` call (used by the
    /// worker pool's stale-lease recovery, spec §5).
    async fn reclaim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<Claimed>, QueueError>;

    /// Count of messages claimed but not yet acked for one priority band.
    async fn pending(&self, priority: JobPriority) -> Result<u64, QueueError>;

    /// Per-entry detail behind `pending`'s count, for inspection/ops tooling.
    async fn pending_detail(&self, priority: JobPriority) -> Result<Vec<PendingEntry>, QueueError>;
}
