//! At-least-once delivery of [`IngestionTask`]s.

mod memory;

pub use memory::MemoryTaskQueue;

use async_trait::async_trait;
use common_types::IngestionTask;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown or expired receipt {0}")]
    UnknownReceipt(i64),

    #[error("queue closed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Identifies one delivery of a task. A redelivered task gets a new receipt,
/// so a worker that lost its delivery cannot ack someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub id: i64,
    pub delivery: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task: IngestionTask,
    pub receipt: Receipt,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: IngestionTask) -> Result<(), QueueError>;

    /// Waits until a task is due and hands it out. The task becomes
    /// invisible until it is acked, nacked or its visibility timeout expires.
    async fn dequeue(&self) -> Result<QueuedTask, QueueError>;

    async fn ack(&self, receipt: Receipt) -> Result<(), QueueError>;

    /// Returns the task for redelivery after `delay` with its
    /// `attempt_count` incremented.
    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<(), QueueError>;

    /// Tasks that are waiting or in flight.
    async fn outstanding(&self) -> Result<usize, QueueError>;
}
