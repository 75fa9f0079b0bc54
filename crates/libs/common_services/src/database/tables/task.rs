use sqlx::FromRow;

/// A claimed row of `ingestion_task`.
#[derive(Debug, FromRow)]
pub struct ClaimedTaskRow {
    pub id: i64,
    pub photo_id: String,
    pub attempt_count: i32,
    pub delivery: i64,
}
