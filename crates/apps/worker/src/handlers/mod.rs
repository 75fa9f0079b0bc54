pub mod merge_pass;
pub mod process_photo;
pub mod reindex;

use std::time::Duration;

/// What the worker loop should do with a delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Remove the task from the queue.
    Ack,
    /// Hand the task back for redelivery after the delay.
    Requeue(Duration),
}
