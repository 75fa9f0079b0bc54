use crate::embedding::{ValidationError, validate_embedding};
use crate::photo::BoundingBox;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A label as returned by the vision service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedLabel {
    pub name: String,
    pub confidence: f32,
}

/// A face as returned by the vision service, before any person is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// Everything the vision service extracts from one image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(default)]
    pub labels: Vec<ClassifiedLabel>,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ClassificationResult {
    /// Rejects responses that would put malformed data in a record.
    pub fn validate(&self, embedding_dimension: usize) -> Result<(), ValidationError> {
        for label in &self.labels {
            if label.name.trim().is_empty() {
                return Err(ValidationError::EmptyLabel);
            }
            if !(0.0..=1.0).contains(&label.confidence) {
                return Err(ValidationError::ConfidenceOutOfRange {
                    label: label.name.clone(),
                    confidence: label.confidence,
                });
            }
        }
        for (face_index, face) in self.faces.iter().enumerate() {
            if !face.bbox.is_finite() {
                return Err(ValidationError::InvalidBoundingBox { face_index });
            }
            validate_embedding(&face.embedding, embedding_dimension)?;
        }
        Ok(())
    }
}

/// Failures of the external vision service. Both are transient.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            embedding,
        }
    }

    #[test]
    fn accepts_well_formed_result() {
        let result = ClassificationResult {
            labels: vec![ClassifiedLabel {
                name: "dog".into(),
                confidence: 0.91,
            }],
            faces: vec![face(vec![1.0, 0.0, 0.0])],
            text: None,
        };
        assert_eq!(result.validate(3), Ok(()));
    }

    #[test]
    fn rejects_percent_confidences() {
        let result = ClassificationResult {
            labels: vec![ClassifiedLabel {
                name: "Person".into(),
                confidence: 97.5,
            }],
            ..Default::default()
        };
        assert!(matches!(
            result.validate(3),
            Err(ValidationError::ConfidenceOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_wrong_face_dimension() {
        let result = ClassificationResult {
            faces: vec![face(vec![1.0, 0.0])],
            ..Default::default()
        };
        assert!(matches!(
            result.validate(3),
            Err(ValidationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn deserializes_sparse_response() -> Result<(), serde_json::Error> {
        let result: ClassificationResult =
            serde_json::from_str(r#"{"labels":[{"name":"beach","confidence":0.5}]}"#)?;
        assert_eq!(result.labels.len(), 1);
        assert!(result.faces.is_empty());
        assert_eq!(result.text, None);
        Ok(())
    }
}
