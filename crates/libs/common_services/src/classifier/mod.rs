//! Clients for the external vision service.

mod http;
mod simulated;

pub use http::{HttpClassifier, HttpClassifierError};
pub use simulated::SimulatedClassifier;

use async_trait::async_trait;
use common_types::{ClassificationResult, ClassifierError};

#[async_trait]
pub trait ClassificationClient: Send + Sync {
    /// Analyses the image stored at `storage_ref`.
    async fn classify(&self, storage_ref: &str) -> Result<ClassificationResult, ClassifierError>;
}
