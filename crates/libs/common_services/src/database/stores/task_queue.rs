use crate::database::tables::ClaimedTaskRow;
use crate::queue::{QueueError, QueuedTask, Receipt, TaskQueue};
use async_trait::async_trait;
use common_types::IngestionTask;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};

/// Ingestion tasks in the `ingestion_task` table, claimed with
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never share a row.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgTaskQueue {
    #[must_use]
    pub const fn new(pool: PgPool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
        }
    }

    /// Claims the next due task. Running tasks whose claim is older than the
    /// visibility timeout count as abandoned and are claimed again.
    async fn claim_next(&self) -> Result<Option<QueuedTask>, QueueError> {
        let row = sqlx::query_as::<_, ClaimedTaskRow>(
            r"
            UPDATE ingestion_task
            SET status = 'running', claimed_at = now(), delivery = delivery + 1
            WHERE id = (
                SELECT id FROM ingestion_task
                WHERE (status = 'queued' AND scheduled_at <= now())
                   OR (status = 'running' AND claimed_at < now() - interval '1 second' * $1)
                ORDER BY scheduled_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, photo_id, attempt_count, delivery
            ",
        )
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            if row.delivery > 1 {
                debug!("Redelivering task {} for photo {}", row.id, row.photo_id);
            }
            QueuedTask {
                task: IngestionTask {
                    photo_id: row.photo_id,
                    attempt_count: row.attempt_count,
                },
                receipt: Receipt {
                    id: row.id,
                    delivery: row.delivery,
                },
            }
        }))
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: IngestionTask) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO ingestion_task (photo_id, attempt_count) VALUES ($1, $2)")
            .bind(&task.photo_id)
            .bind(task.attempt_count)
            .execute(&self.pool)
            .await?;
        info!("Enqueued ingestion task for photo {}", task.photo_id);
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueuedTask, QueueError> {
        loop {
            if let Some(task) = self.claim_next().await? {
                return Ok(task);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM ingestion_task WHERE id = $1 AND delivery = $2 AND status = 'running'",
        )
        .bind(receipt.id)
        .bind(receipt.delivery)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt.id));
        }
        Ok(())
    }

    async fn nack(&self, receipt: Receipt, delay: Duration) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE ingestion_task
            SET status = 'queued',
                attempt_count = attempt_count + 1,
                claimed_at = NULL,
                scheduled_at = now() + interval '1 second' * $3
            WHERE id = $1 AND delivery = $2 AND status = 'running'
            ",
        )
        .bind(receipt.id)
        .bind(receipt.delivery)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt.id));
        }
        Ok(())
    }

    async fn outstanding(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_task")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
