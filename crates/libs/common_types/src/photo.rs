use crate::classification::{ClassificationResult, ClassifiedLabel, DetectedFace};
use crate::{OwnerId, PersonId, PhotoId};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Lifecycle of the asynchronous analysis of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "photo_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ProcessingState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Processing -> Processing` is a worker resuming after an expired lease.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed | Self::Processing, Self::Processing)
                | (
                    Self::Processing,
                    Self::Processed | Self::Failed | Self::Pending
                )
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("photo {photo_id} cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub photo_id: PhotoId,
    pub from: ProcessingState,
    pub to: ProcessingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub person_id: Option<PersonId>,
}

impl FaceDetection {
    fn same_detection(&self, other: &DetectedFace) -> bool {
        self.bbox == other.bbox && self.embedding == other.embedding
    }
}

/// One uploaded image and everything the pipeline learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub photo_id: PhotoId,
    pub owner_id: OwnerId,
    pub storage_ref: String,
    pub thumbnail_ref: String,
    pub uploaded_at: DateTime<Utc>,
    pub taken_at: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub state: ProcessingState,
    pub labels: Vec<Label>,
    pub faces: Vec<FaceDetection>,
    pub extracted_text: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// What the upload handler knows about a photo when it arrives.
#[derive(Debug, Clone, Builder)]
pub struct NewPhoto {
    pub owner_id: OwnerId,
    #[builder(into)]
    pub storage_ref: String,
    #[builder(into)]
    pub thumbnail_ref: String,
    pub taken_at: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
}

impl PhotoRecord {
    #[must_use]
    pub fn new_pending(photo_id: PhotoId, photo: NewPhoto, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            photo_id,
            owner_id: photo.owner_id,
            storage_ref: photo.storage_ref,
            thumbnail_ref: photo.thumbnail_ref,
            uploaded_at,
            taken_at: photo.taken_at,
            location: photo.location,
            state: ProcessingState::Pending,
            labels: Vec::new(),
            faces: Vec::new(),
            extracted_text: None,
            retry_count: 0,
            last_error: None,
            processed_at: None,
        }
    }

    pub fn transition(&mut self, next: ProcessingState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                photo_id: self.photo_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Replaces labels, faces and text with the classifier's response.
    ///
    /// Re-applying the same response leaves the record unchanged: labels are
    /// recomputed rather than accumulated, and a face identical to the one
    /// already stored at its index keeps its person id.
    pub fn apply_classification(&mut self, result: &ClassificationResult) {
        self.labels = normalize_labels(&result.labels);

        let previous = std::mem::take(&mut self.faces);
        self.faces = result
            .faces
            .iter()
            .enumerate()
            .map(|(index, detected)| FaceDetection {
                bbox: detected.bbox,
                embedding: detected.embedding.clone(),
                person_id: previous
                    .get(index)
                    .filter(|old| old.same_detection(detected))
                    .and_then(|old| old.person_id.clone()),
            })
            .collect();

        self.extracted_text = result
            .text
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }

    /// Moves a `Processing` record to `Processed`.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ProcessingState::Processed)?;
        self.processed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// Moves a `Processing` record to the terminal `Failed` state.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(ProcessingState::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Indices of faces the clustering engine has not assigned yet.
    pub fn unassigned_faces(&self) -> impl Iterator<Item = (usize, &FaceDetection)> {
        self.faces
            .iter()
            .enumerate()
            .filter(|(_, face)| face.person_id.is_none())
    }

    /// The capture time if known, otherwise the upload time.
    #[must_use]
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.taken_at.unwrap_or(self.uploaded_at)
    }
}

/// Deduplicates labels case-insensitively, keeping the most confident
/// variant, ordered by name.
#[must_use]
pub fn normalize_labels(labels: &[ClassifiedLabel]) -> Vec<Label> {
    let mut best: HashMap<String, Label> = HashMap::new();
    for label in labels {
        let name = label.name.trim();
        if name.is_empty() {
            continue;
        }
        let entry = best.entry(name.to_lowercase()).or_insert_with(|| Label {
            name: name.to_string(),
            confidence: label.confidence,
        });
        if label.confidence > entry.confidence {
            entry.name = name.to_string();
            entry.confidence = label.confidence;
        }
    }
    let mut labels: Vec<(String, Label)> = best.into_iter().collect();
    labels.sort_by(|(a, _), (b, _)| a.cmp(b));
    labels.into_iter().map(|(_, label)| label).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessingState::{Failed, Pending, Processed, Processing};

    fn record() -> PhotoRecord {
        let photo = NewPhoto::builder()
            .owner_id(1)
            .storage_ref("originals/1/p1.jpg")
            .thumbnail_ref("thumbs/1/p1.avif")
            .build();
        PhotoRecord::new_pending("p1".into(), photo, Utc::now())
    }

    fn result() -> ClassificationResult {
        ClassificationResult {
            labels: vec![
                ClassifiedLabel {
                    name: "dog".into(),
                    confidence: 0.91,
                },
                ClassifiedLabel {
                    name: "beach".into(),
                    confidence: 0.77,
                },
                ClassifiedLabel {
                    name: "Dog".into(),
                    confidence: 0.5,
                },
            ],
            faces: vec![DetectedFace {
                bbox: BoundingBox::new(0.1, 0.2, 0.3, 0.4),
                embedding: vec![1.0, 0.0, 0.0],
            }],
            text: Some("  hello world ".into()),
        }
    }

    #[test]
    fn allowed_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Processing));

        assert!(!Processed.can_transition_to(Pending));
        assert!(!Processed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Processed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn rejected_transition_leaves_state() {
        let mut record = record();
        let err = record.transition(Processed);
        assert!(err.is_err());
        assert_eq!(record.state, Pending);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let mut record = record();
        record.transition(Processing).ok();
        record.apply_classification(&result());
        let once = record.clone();
        record.apply_classification(&result());
        assert_eq!(record, once);

        assert_eq!(record.labels.len(), 2);
        assert_eq!(record.labels[0].name, "beach");
        assert_eq!(record.labels[1].name, "dog");
        assert!((record.labels[1].confidence - 0.91).abs() < f32::EPSILON);
        assert_eq!(record.extracted_text.as_deref(), Some("hello world"));
    }

    #[test]
    fn reapplying_keeps_person_of_identical_face() {
        let mut record = record();
        record.apply_classification(&result());
        record.faces[0].person_id = Some("alice".into());

        record.apply_classification(&result());
        assert_eq!(record.faces[0].person_id.as_deref(), Some("alice"));

        let mut moved = result();
        moved.faces[0].bbox.x = 0.5;
        record.apply_classification(&moved);
        assert_eq!(record.faces[0].person_id, None);
    }

    #[test]
    fn failure_records_reason() {
        let mut record = record();
        record.transition(Processing).ok();
        assert!(record.mark_failed("classifier down").is_ok());
        assert_eq!(record.state, Failed);
        assert_eq!(record.last_error.as_deref(), Some("classifier down"));
    }
}
