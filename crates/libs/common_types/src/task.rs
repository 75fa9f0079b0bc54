use crate::PhotoId;
use serde::{Deserialize, Serialize};

/// A request to analyse one photo, carried by the ingestion queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTask {
    pub photo_id: PhotoId,
    /// Number of times this task was handed back to the queue.
    pub attempt_count: i32,
}

impl IngestionTask {
    #[must_use]
    pub fn new(photo_id: impl Into<PhotoId>) -> Self {
        Self {
            photo_id: photo_id.into(),
            attempt_count: 0,
        }
    }
}
