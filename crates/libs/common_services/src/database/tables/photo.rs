use chrono::{DateTime, Utc};
use common_types::{FaceDetection, GeoPoint, Label, PhotoRecord, ProcessingState};
use sqlx::FromRow;
use sqlx::types::Json;

/// Columns selected for every photo query, in [`PhotoRow`] order.
pub const PHOTO_COLUMNS: &str = "photo_id, owner_id, storage_ref, thumbnail_ref, uploaded_at, \
     taken_at, latitude, longitude, state, labels, faces, extracted_text, retry_count, \
     last_error, processed_at";

#[derive(Debug, FromRow)]
pub struct PhotoRow {
    pub photo_id: String,
    pub owner_id: i32,
    pub storage_ref: String,
    pub thumbnail_ref: String,
    pub uploaded_at: DateTime<Utc>,
    pub taken_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub state: ProcessingState,
    pub labels: Json<Vec<Label>>,
    pub faces: Json<Vec<FaceDetection>>,
    pub extracted_text: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<PhotoRow> for PhotoRecord {
    fn from(row: PhotoRow) -> Self {
        let location = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Self {
            photo_id: row.photo_id,
            owner_id: row.owner_id,
            storage_ref: row.storage_ref,
            thumbnail_ref: row.thumbnail_ref,
            uploaded_at: row.uploaded_at,
            taken_at: row.taken_at,
            location,
            state: row.state,
            labels: row.labels.0,
            faces: row.faces.0,
            extracted_text: row.extracted_text,
            retry_count: row.retry_count,
            last_error: row.last_error,
            processed_at: row.processed_at,
        }
    }
}
