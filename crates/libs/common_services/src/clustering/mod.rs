//! Incremental face clustering: nearest-centroid assignment plus a periodic
//! merge of clusters that drifted together.

mod centroid_index;
mod engine;
mod memory;
mod state;

pub use centroid_index::{CentroidIndex, Neighbor};
pub use engine::{FaceClusterEngine, MergeReport};
pub use memory::MemoryClusterStore;
pub use state::OwnerClusters;

use crate::metadata::StoreError;
use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonCluster, PersonId, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid face embedding: {0}")]
    Validation(#[from] ValidationError),

    #[error("cluster {0} does not exist")]
    UnknownPerson(PersonId),

    /// The stored cluster moved on since it was read, or was merged away.
    #[error("cluster {0} changed in the store")]
    Stale(PersonId),

    #[error(transparent)]
    Metadata(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// An absorbed person and the live cluster it now belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub owner_id: OwnerId,
    pub person_id: PersonId,
    pub merged_into: PersonId,
}

/// Everything the engine needs to rebuild its in-memory state.
#[derive(Debug, Clone, Default)]
pub struct StoredClusters {
    pub clusters: Vec<PersonCluster>,
    pub redirects: Vec<Redirect>,
}

/// Durable home of the engine's clusters.
///
/// Writes are conditional on the version the caller last read, so several
/// engines can share one store. A write against a cluster that changed or
/// was merged away fails with [`ClusterError::Stale`] and changes nothing.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn load(&self) -> Result<StoredClusters, ClusterError>;

    /// Live clusters and redirects of a single owner.
    async fn load_owner(&self, owner_id: OwnerId) -> Result<StoredClusters, ClusterError>;

    /// Persists `cluster` after `member` joined it. `expected_version` is the
    /// stored version before the change, `None` for a new cluster.
    async fn record_assignment(
        &self,
        cluster: &PersonCluster,
        member: &FaceRef,
        expected_version: Option<i64>,
    ) -> Result<(), ClusterError>;

    /// Persists `survivor` after it absorbed `absorbed`, moving the absorbed
    /// members and leaving a redirect behind. `survivor_version` is the
    /// survivor's stored version before the merge.
    async fn commit_merge(
        &self,
        survivor: &PersonCluster,
        survivor_version: i64,
        absorbed: &PersonCluster,
    ) -> Result<(), ClusterError>;
}
