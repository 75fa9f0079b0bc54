use crate::database::tables::{PhotoRow, PHOTO_COLUMNS};
use crate::metadata::{rewrite_person, MetadataStore, Mutator, PhotoFilter, StoreError};
use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonId, PhotoRecord};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Postgres};
use std::collections::BTreeSet;

/// Photo records in the `photo` table. Per-record exclusion comes from
/// `SELECT ... FOR UPDATE` inside a transaction.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write(
        executor: impl Executor<'_, Database = Postgres>,
        record: &PhotoRecord,
    ) -> Result<(), StoreError> {
        let latitude = record.location.map(|l| l.latitude);
        let longitude = record.location.map(|l| l.longitude);
        sqlx::query(
            r"
            INSERT INTO photo (photo_id, owner_id, storage_ref, thumbnail_ref, uploaded_at,
                               taken_at, latitude, longitude, state, labels, faces,
                               extracted_text, retry_count, last_error, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (photo_id) DO UPDATE SET
                storage_ref = EXCLUDED.storage_ref,
                thumbnail_ref = EXCLUDED.thumbnail_ref,
                taken_at = EXCLUDED.taken_at,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                state = EXCLUDED.state,
                labels = EXCLUDED.labels,
                faces = EXCLUDED.faces,
                extracted_text = EXCLUDED.extracted_text,
                retry_count = EXCLUDED.retry_count,
                last_error = EXCLUDED.last_error,
                processed_at = EXCLUDED.processed_at
            ",
        )
        .bind(&record.photo_id)
        .bind(record.owner_id)
        .bind(&record.storage_ref)
        .bind(&record.thumbnail_ref)
        .bind(record.uploaded_at)
        .bind(record.taken_at)
        .bind(latitude)
        .bind(longitude)
        .bind(record.state)
        .bind(Json(&record.labels))
        .bind(Json(&record.faces))
        .bind(&record.extracted_text)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.processed_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn put(&self, record: PhotoRecord) -> Result<(), StoreError> {
        Self::write(&self.pool, &record).await
    }

    async fn get(&self, photo_id: &str) -> Result<PhotoRecord, StoreError> {
        let sql = format!("SELECT {PHOTO_COLUMNS} FROM photo WHERE photo_id = $1");
        sqlx::query_as::<_, PhotoRow>(&sql)
            .bind(photo_id)
            .fetch_optional(&self.pool)
            .await?
            .map(PhotoRecord::from)
            .ok_or_else(|| StoreError::NotFound(photo_id.to_string()))
    }

    async fn update(&self, photo_id: &str, mutator: Mutator<'_>) -> Result<PhotoRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {PHOTO_COLUMNS} FROM photo WHERE photo_id = $1 FOR UPDATE");
        let mut record: PhotoRecord = sqlx::query_as::<_, PhotoRow>(&sql)
            .bind(photo_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(PhotoRecord::from)
            .ok_or_else(|| StoreError::NotFound(photo_id.to_string()))?;

        // Dropping the transaction on error rolls it back.
        mutator(&mut record)?;
        Self::write(&mut *tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn list(&self, owner_id: OwnerId, filter: &PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError> {
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM photo
             WHERE owner_id = $1 AND ($2::photo_state IS NULL OR state = $2)
             ORDER BY uploaded_at, photo_id"
        );
        let rows = sqlx::query_as::<_, PhotoRow>(&sql)
            .bind(owner_id)
            .bind(filter.state)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(PhotoRecord::from)
            .filter(|record| filter.matches(record))
            .collect())
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, i32>("SELECT DISTINCT owner_id FROM photo ORDER BY owner_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn reassign_person(
        &self,
        from: &PersonId,
        to: &PersonId,
        members: &[FaceRef],
    ) -> Result<usize, StoreError> {
        let photo_ids: Vec<String> = members
            .iter()
            .map(|m| m.photo_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM photo WHERE photo_id = ANY($1) ORDER BY photo_id FOR UPDATE"
        );
        let rows = sqlx::query_as::<_, PhotoRow>(&sql)
            .bind(&photo_ids)
            .fetch_all(&mut *tx)
            .await?;
        if rows.len() != photo_ids.len() {
            let found: BTreeSet<&str> = rows.iter().map(|r| r.photo_id.as_str()).collect();
            let missing = photo_ids
                .iter()
                .find(|id| !found.contains(id.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(StoreError::NotFound(missing));
        }

        let mut changed = 0;
        for row in rows {
            let mut record = PhotoRecord::from(row);
            let rewritten = rewrite_person(&mut record, from, to, members);
            if rewritten > 0 {
                sqlx::query("UPDATE photo SET faces = $2 WHERE photo_id = $1")
                    .bind(&record.photo_id)
                    .bind(Json(&record.faces))
                    .execute(&mut *tx)
                    .await?;
                changed += rewritten;
            }
        }
        tx.commit().await?;
        Ok(changed)
    }
}

