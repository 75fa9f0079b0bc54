//! Exclusive, expiring processing claims keyed by photo id.

mod memory;

pub use memory::MemoryLeaseManager;

use async_trait::async_trait;
use common_types::PhotoId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease on {0} is no longer held by this token")]
    Lost(PhotoId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Proof of holding the processing lease for one photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub photo_id: PhotoId,
    pub token: String,
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Claims the photo unless a live lease exists. An expired lease is
    /// taken over.
    async fn try_acquire(&self, photo_id: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError>;

    /// Pushes the expiry to `ttl` from now. Fails if the token no longer
    /// matches.
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError>;

    /// Drops the lease. Releasing a lease that was already taken over is a
    /// no-op for the new holder.
    async fn release(&self, lease: &Lease) -> Result<(), LeaseError>;
}

pub(crate) fn new_token() -> String {
    crate::utils::nice_id(24)
}
