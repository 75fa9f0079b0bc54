use app_state::AppSettings;
use color_eyre::Result;
use common_services::backend::Backends;
use common_services::classifier::ClassificationClient;
use common_services::clustering::FaceClusterEngine;
use common_services::lease::LeaseManager;
use common_services::metadata::{MetadataStore, PhotoFilter};
use common_services::queue::TaskQueue;
use common_services::search::{InMemorySearchIndex, IndexSync, SearchIndex};
use common_services::utils::nice_id;
use common_types::ProcessingState;
use std::sync::Arc;
use tracing::info;

/// Everything a worker needs, shared by all worker tasks of one process.
pub struct WorkerContext {
    pub worker_id: String,
    pub settings: AppSettings,
    pub metadata: Arc<dyn MetadataStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub leases: Arc<dyn LeaseManager>,
    pub classifier: Arc<dyn ClassificationClient>,
    pub engine: FaceClusterEngine,
    pub index: IndexSync,
}

impl WorkerContext {
    /// Creates a context with a fresh in-memory search index, rebuilt from
    /// the processed records in the store.
    pub async fn new(
        settings: AppSettings,
        backends: Backends,
        classifier: Arc<dyn ClassificationClient>,
    ) -> Result<Self> {
        Self::with_index(settings, backends, classifier, Arc::new(InMemorySearchIndex::new())).await
    }

    pub async fn with_index(
        settings: AppSettings,
        backends: Backends,
        classifier: Arc<dyn ClassificationClient>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let engine = FaceClusterEngine::load(
            backends.clusters.clone(),
            backends.metadata.clone(),
            settings.clustering.clone(),
        )
        .await?;
        let index = IndexSync::new(index, backends.metadata.clone());
        index.rebuild().await?;

        Ok(Self {
            worker_id: nice_id(8),
            settings,
            metadata: backends.metadata,
            queue: backends.queue,
            leases: backends.leases,
            classifier,
            engine,
            index,
        })
    }

    /// Clusters faces of processed photos that never reached the engine,
    /// e.g. after a crash between processing and clustering.
    pub async fn assign_unclustered(&self) -> Result<usize> {
        let filter = PhotoFilter {
            state: Some(ProcessingState::Processed),
            unassigned_faces_only: true,
        };
        let mut assigned = 0;
        for owner_id in self.metadata.owners().await? {
            for record in self.metadata.list(owner_id, &filter).await? {
                assigned += self.engine.assign_photo(&record.photo_id).await?.len();
            }
        }
        if assigned > 0 {
            info!("Clustered {assigned} faces left over from earlier runs");
        }
        Ok(assigned)
    }
}
