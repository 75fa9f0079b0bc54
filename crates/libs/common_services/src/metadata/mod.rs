//! Durable keyed storage for [`PhotoRecord`]s.

mod memory;

pub use memory::MemoryMetadataStore;

use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonId, PhotoId, PhotoRecord, ProcessingState, TransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("photo {0} not found")]
    NotFound(PhotoId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Read-modify-write step run under the record's lock. Returning an error
/// aborts the update and leaves the stored record untouched.
pub type Mutator<'a> = Box<dyn FnOnce(&mut PhotoRecord) -> Result<(), StoreError> + Send + 'a>;

/// Selects records for batch operations such as index rebuilds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoFilter {
    pub state: Option<ProcessingState>,
    /// Only records with at least one face lacking a person id.
    pub unassigned_faces_only: bool,
}

impl PhotoFilter {
    #[must_use]
    pub const fn in_state(state: ProcessingState) -> Self {
        Self {
            state: Some(state),
            unassigned_faces_only: false,
        }
    }

    #[must_use]
    pub fn matches(&self, record: &PhotoRecord) -> bool {
        if self.state.is_some_and(|state| record.state != state) {
            return false;
        }
        if self.unassigned_faces_only && record.unassigned_faces().next().is_none() {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Creates or fully replaces a record.
    async fn put(&self, record: PhotoRecord) -> Result<(), StoreError>;

    async fn get(&self, photo_id: &str) -> Result<PhotoRecord, StoreError>;

    /// Atomic read-modify-write. Updates to the same photo are serialized;
    /// updates to different photos do not wait on each other.
    async fn update(&self, photo_id: &str, mutator: Mutator<'_>) -> Result<PhotoRecord, StoreError>;

    /// Records of one owner matching `filter`, oldest upload first.
    async fn list(&self, owner_id: OwnerId, filter: &PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError>;

    /// Every owner with at least one record.
    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError>;

    /// Rewrites `from` to `to` on every listed face that still points at
    /// `from`. Either all affected records change or none do.
    async fn reassign_person(
        &self,
        from: &PersonId,
        to: &PersonId,
        members: &[FaceRef],
    ) -> Result<usize, StoreError>;
}

/// Applies a person rewrite to one record, returning how many faces changed.
pub(crate) fn rewrite_person(
    record: &mut PhotoRecord,
    from: &PersonId,
    to: &PersonId,
    members: &[FaceRef],
) -> usize {
    let mut changed = 0;
    for member in members.iter().filter(|m| m.photo_id == record.photo_id) {
        let Ok(index) = usize::try_from(member.face_index) else {
            continue;
        };
        if let Some(face) = record.faces.get_mut(index)
            && face.person_id.as_ref() == Some(from)
        {
            face.person_id = Some(to.clone());
            changed += 1;
        }
    }
    changed
}
