use crate::{OwnerId, PersonId, PhotoId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Back-reference from a person to one face of one photo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaceRef {
    pub photo_id: PhotoId,
    pub face_index: i32,
}

impl FaceRef {
    #[must_use]
    pub fn new(photo_id: impl Into<PhotoId>, face_index: i32) -> Self {
        Self {
            photo_id: photo_id.into(),
            face_index,
        }
    }
}

/// A group of faces believed to show the same person.
///
/// `member_count` always equals `member_refs.len()` and is never zero for a
/// live cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonCluster {
    pub person_id: PersonId,
    pub owner_id: OwnerId,
    pub centroid: Vec<f32>,
    pub member_count: i64,
    pub member_refs: BTreeSet<FaceRef>,
    /// Bumped on every centroid or membership change.
    pub version: i64,
}

impl PersonCluster {
    /// A new cluster seeded with a single face.
    #[must_use]
    pub fn seeded(person_id: PersonId, owner_id: OwnerId, face: FaceRef, embedding: &[f32]) -> Self {
        Self {
            person_id,
            owner_id,
            centroid: embedding.to_vec(),
            member_count: 1,
            member_refs: BTreeSet::from([face]),
            version: 1,
        }
    }

    /// Adds a face and moves the centroid to the running mean of all members.
    #[allow(clippy::cast_precision_loss)]
    pub fn add_member(&mut self, face: FaceRef, embedding: &[f32]) {
        if !self.member_refs.insert(face) {
            return;
        }
        let n = (self.member_count + 1) as f32;
        for (c, e) in self.centroid.iter_mut().zip(embedding) {
            *c += (e - *c) / n;
        }
        self.member_count += 1;
        self.version += 1;
    }

    /// Folds `other` into this cluster, weighting both centroids by size.
    #[allow(clippy::cast_precision_loss)]
    pub fn absorb(&mut self, other: &Self) {
        let own = self.member_count as f32;
        let theirs = other.member_count as f32;
        let total = own + theirs;
        if total > 0.0 {
            for (c, o) in self.centroid.iter_mut().zip(&other.centroid) {
                *c = (*c * own + o * theirs) / total;
            }
        }
        self.member_refs.extend(other.member_refs.iter().cloned());
        self.member_count = i64::try_from(self.member_refs.len()).unwrap_or(i64::MAX);
        self.version = self.version.max(other.version) + 1;
    }
}
