use crate::classifier::{ClassificationClient, HttpClassifier, SimulatedClassifier};
use crate::clustering::{ClusterStore, MemoryClusterStore};
use crate::database::{
    get_db_pool, run_migrations, PgClusterStore, PgLeaseManager, PgMetadataStore, PgTaskQueue,
};
use crate::lease::{LeaseManager, MemoryLeaseManager};
use crate::metadata::{MemoryMetadataStore, MetadataStore};
use crate::queue::{MemoryTaskQueue, TaskQueue};
use app_state::{AppSettings, ClassifierKind, StorageBackend};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The storage side of the pipeline, picked by `storage.backend`.
#[derive(Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub leases: Arc<dyn LeaseManager>,
    pub clusters: Arc<dyn ClusterStore>,
}

impl Backends {
    /// Process-local backends. Nothing survives a restart.
    #[must_use]
    pub fn in_memory(visibility_timeout: Duration) -> Self {
        Self {
            metadata: Arc::new(MemoryMetadataStore::new()),
            queue: Arc::new(MemoryTaskQueue::new(visibility_timeout)),
            leases: Arc::new(MemoryLeaseManager::new()),
            clusters: Arc::new(MemoryClusterStore::new()),
        }
    }

    /// Postgres backends sharing one pool, with migrations applied.
    pub async fn postgres(settings: &AppSettings) -> Result<Self> {
        let pool = get_db_pool(settings).await?;
        run_migrations(&pool).await?;
        Ok(Self {
            metadata: Arc::new(PgMetadataStore::new(pool.clone())),
            queue: Arc::new(PgTaskQueue::new(
                pool.clone(),
                settings.pipeline.visibility_timeout,
                settings.pipeline.poll_interval,
            )),
            leases: Arc::new(PgLeaseManager::new(pool.clone())),
            clusters: Arc::new(PgClusterStore::new(pool)),
        })
    }

    pub async fn connect(settings: &AppSettings) -> Result<Self> {
        match settings.storage.backend {
            StorageBackend::Postgres => Self::postgres(settings).await,
            StorageBackend::Memory => {
                info!("Using in-memory storage; nothing will be persisted.");
                Ok(Self::in_memory(settings.pipeline.visibility_timeout))
            }
        }
    }
}

/// Builds the vision service client picked by `classifier.kind`.
pub fn classifier_from_settings(settings: &AppSettings) -> Result<Arc<dyn ClassificationClient>> {
    Ok(match settings.classifier.kind {
        ClassifierKind::Http => Arc::new(HttpClassifier::new(
            &settings.classifier.base_url,
            settings.pipeline.classifier_timeout,
        )?),
        ClassifierKind::Simulated => Arc::new(SimulatedClassifier::new(
            settings.clustering.embedding_dimension,
            Duration::from_millis(settings.classifier.simulated_latency_ms),
        )),
    })
}
