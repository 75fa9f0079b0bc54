use crate::lease::{new_token, Lease, LeaseError, LeaseManager};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

/// Processing leases in the `photo_lease` table. Expiry is judged by the
/// database clock so workers with skewed clocks agree.
#[derive(Clone)]
pub struct PgLeaseManager {
    pool: PgPool,
}

impl PgLeaseManager {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseManager for PgLeaseManager {
    async fn try_acquire(&self, photo_id: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let token = new_token();
        let acquired: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO photo_lease (photo_id, token, expires_at)
            VALUES ($1, $2, now() + interval '1 second' * $3)
            ON CONFLICT (photo_id) DO UPDATE SET
                token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE photo_lease.expires_at <= now()
            RETURNING token
            ",
        )
        .bind(photo_id)
        .bind(&token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.map(|token| Lease {
            photo_id: photo_id.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError> {
        let result = sqlx::query(
            "UPDATE photo_lease SET expires_at = now() + interval '1 second' * $3
             WHERE photo_id = $1 AND token = $2",
        )
        .bind(&lease.photo_id)
        .bind(&lease.token)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LeaseError::Lost(lease.photo_id.clone()));
        }
        Ok(())
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        sqlx::query("DELETE FROM photo_lease WHERE photo_id = $1 AND token = $2")
            .bind(&lease.photo_id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
