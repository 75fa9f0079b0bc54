use super::{QueueError, QueuedTask, Receipt, TaskQueue};
use async_trait::async_trait;
use common_types::IngestionTask;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

struct InFlight {
    task: IngestionTask,
    delivery: i64,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    next_delivery: i64,
    seq: u64,
    /// Waiting tasks keyed by due time, then insertion order.
    scheduled: BTreeMap<(Instant, u64), (i64, IngestionTask)>,
    in_flight: HashMap<i64, InFlight>,
    closed: bool,
}

impl Inner {
    fn schedule(&mut self, id: i64, task: IngestionTask, due: Instant) {
        self.seq += 1;
        self.scheduled.insert((due, self.seq), (id, task));
    }

    /// Puts deliveries whose visibility timeout ran out back in line.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                debug!(
                    "Visibility timeout expired for task {id} ({}), redelivering",
                    flight.task.photo_id
                );
                self.schedule(id, flight.task, now);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let due = self.scheduled.keys().next().map(|(due, _)| *due);
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (due, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process queue with a delay schedule and an in-flight table.
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl MemoryTaskQueue {
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Wakes every waiting consumer with [`QueueError::Closed`].
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    async fn settle(&self, receipt: Receipt) -> Result<IngestionTask, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.get(&receipt.id) {
            Some(flight) if flight.delivery == receipt.delivery => {}
            _ => return Err(QueueError::UnknownReceipt(receipt.id)),
        }
        inner
            .in_flight
            .remove(&receipt.id)
            .map(|flight| flight.task)
            .ok_or(QueueError::UnknownReceipt(receipt.id))
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: IngestionTask) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.schedule(id, task, Instant::now());
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueuedTask, QueueError> {
        loop {
            // Registered before inspecting the queue so a concurrent enqueue is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wakeup = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                let now = Instant::now();
                inner.reclaim_expired(now);

                let ready = inner
                    .scheduled
                    .first_key_value()
                    .is_some_and(|((due, _), _)| *due <= now);
                if ready && let Some((_, (id, task))) = inner.scheduled.pop_first() {
                    inner.next_delivery += 1;
                    let delivery = inner.next_delivery;
                    inner.in_flight.insert(
                        id,
                        InFlight {
                            task: task.clone(),
                            delivery,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(QueuedTask {
                        task,
                        receipt: Receipt { id, delivery },
                    });
                }
                inner.next_wakeup()
            };

            match wakeup {
                Some(at) => {
                    tokio::select! {
                        () = sleep_until(at) => {}
                        () = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), QueueError> {
        self.settle(receipt).await.map(|_| ())
    }

    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<(), QueueError> {
        let mut task = self.settle(receipt).await?;
        task.attempt_count += 1;
        let mut inner = self.inner.lock().await;
        inner.schedule(receipt.id, task, Instant::now() + delay);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn outstanding(&self) -> Result<usize, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.scheduled.len() + inner.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> MemoryTaskQueue {
        MemoryTaskQueue::new(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn ack_removes_task() -> color_eyre::Result<()> {
        let queue = queue();
        queue.enqueue(IngestionTask::new("p1")).await?;
        let delivered = queue.dequeue().await?;
        assert_eq!(delivered.task.photo_id, "p1");
        assert_eq!(queue.outstanding().await?, 1);

        queue.ack(delivered.receipt).await?;
        assert_eq!(queue.outstanding().await?, 0);
        assert!(queue.ack(delivered.receipt).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_delay_with_incremented_attempts() -> color_eyre::Result<()> {
        let queue = queue();
        queue.enqueue(IngestionTask::new("p1")).await?;
        let first = queue.dequeue().await?;

        let start = Instant::now();
        queue.nack(first.receipt, Duration::from_secs(8)).await?;
        let second = queue.dequeue().await?;

        assert!(start.elapsed() >= Duration::from_secs(8));
        assert_eq!(second.task.attempt_count, 1);
        assert_ne!(second.receipt.delivery, first.receipt.delivery);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_task_is_redelivered_after_visibility_timeout() -> color_eyre::Result<()> {
        let queue = MemoryTaskQueue::new(Duration::from_secs(30));
        queue.enqueue(IngestionTask::new("p1")).await?;
        let first = queue.dequeue().await?;

        let second = queue.dequeue().await?;
        assert_eq!(second.task.photo_id, "p1");
        assert_eq!(second.receipt.id, first.receipt.id);

        // The stale delivery can no longer settle the task.
        assert!(queue.ack(first.receipt).await.is_err());
        queue.ack(second.receipt).await?;
        Ok(())
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_enqueue() -> color_eyre::Result<()> {
        let queue = Arc::new(queue());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(IngestionTask::new("late")).await?;

        let delivered = consumer.await??;
        assert_eq!(delivered.task.photo_id, "late");
        Ok(())
    }

    #[tokio::test]
    async fn close_releases_waiting_consumers() {
        let queue = Arc::new(queue());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.close().await;
        let result = consumer.await;
        assert!(matches!(result, Ok(Err(QueueError::Closed))));
    }
}
