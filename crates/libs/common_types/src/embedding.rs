use thiserror::Error;

/// Input that is rejected before it can touch any state.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding contains a non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("embedding is the zero vector")]
    ZeroVector,

    #[error("label {label:?} has confidence {confidence} outside [0, 1]")]
    ConfidenceOutOfRange { label: String, confidence: f32 },

    #[error("label name is empty")]
    EmptyLabel,

    #[error("bounding box of face {face_index} is not finite")]
    InvalidBoundingBox { face_index: usize },
}

/// Checks that an embedding can be compared against the system's centroids.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<(), ValidationError> {
    if embedding.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            actual: embedding.len(),
        });
    }
    if let Some(index) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(ValidationError::NonFinite { index });
    }
    if embedding.iter().all(|v| *v == 0.0) {
        return Err(ValidationError::ZeroVector);
    }
    Ok(())
}

/// Cosine distance (`1 - cos θ`) between two equal-length vectors, in `[0, 2]`.
///
/// Vectors of unequal length or with zero norm are treated as orthogonal.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 1.0;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0_f32, 0.0_f32, 0.0_f32), |(dot, na, nb), (x, y)| {
            (x.mul_add(*y, dot), x.mul_add(*x, na), y.mul_add(*y, nb))
        });
    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        return 1.0;
    }
    (1.0 - dot / denominator).clamp(0.0, 2.0)
}

/// Scales a vector to unit length. The zero vector is returned unchanged.
#[must_use]
pub fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}
