use pgvector::Vector;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct PersonRow {
    pub person_id: String,
    pub owner_id: i32,
    pub centroid: Vector,
    pub member_count: i64,
    pub version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PersonMemberRow {
    pub photo_id: String,
    pub face_index: i32,
    pub person_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct RedirectRow {
    pub person_id: String,
    pub owner_id: i32,
    pub merged_into: String,
}
