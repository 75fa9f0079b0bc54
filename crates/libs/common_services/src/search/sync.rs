use super::{IndexDocument, SearchIndex};
use crate::metadata::{MetadataStore, PhotoFilter, StoreError};
use common_types::{PhotoId, PhotoRecord, ProcessingState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Keeps the search index in step with the metadata store.
///
/// The store is the source of truth. A failed index write never fails the
/// caller; the photo is parked and retried by [`IndexSync::retry_pending`].
pub struct IndexSync {
    index: Arc<dyn SearchIndex>,
    metadata: Arc<dyn MetadataStore>,
    pending: Mutex<BTreeSet<PhotoId>>,
}

impl IndexSync {
    #[must_use]
    pub fn new(index: Arc<dyn SearchIndex>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            index,
            metadata,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    /// Indexes one record. Returns `false` if the write was parked for retry.
    pub async fn upsert_record(&self, record: &PhotoRecord) -> bool {
        match self.index.upsert(IndexDocument::from_record(record)).await {
            Ok(()) => {
                self.pending.lock().await.remove(&record.photo_id);
                true
            }
            Err(err) => {
                warn!("Indexing photo {} failed, queued for reindex: {err}", record.photo_id);
                self.pending.lock().await.insert(record.photo_id.clone());
                false
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Re-indexes parked photos from their current records. Returns how many
    /// made it into the index.
    pub async fn retry_pending(&self) -> Result<usize, StoreError> {
        let parked = std::mem::take(&mut *self.pending.lock().await);
        if parked.is_empty() {
            return Ok(0);
        }

        let mut repaired = 0;
        let mut still_pending = BTreeSet::new();
        let mut parked = parked.into_iter();
        while let Some(photo_id) = parked.next() {
            let record = match self.metadata.get(&photo_id).await {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => {
                    still_pending.insert(photo_id);
                    still_pending.extend(parked);
                    self.pending.lock().await.extend(still_pending);
                    return Err(err);
                }
            };
            if record.state != ProcessingState::Processed {
                continue;
            }
            match self.index.upsert(IndexDocument::from_record(&record)).await {
                Ok(()) => repaired += 1,
                Err(err) => {
                    warn!("Reindexing photo {photo_id} failed again: {err}");
                    still_pending.insert(photo_id);
                }
            }
        }

        self.pending.lock().await.extend(still_pending);
        if repaired > 0 {
            info!("Reindexed {repaired} parked photos");
        }
        Ok(repaired)
    }

    /// Writes every processed record of every owner into the index.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let mut indexed = 0;
        for owner_id in self.metadata.owners().await? {
            let records = self
                .metadata
                .list(owner_id, &PhotoFilter::in_state(ProcessingState::Processed))
                .await?;
            for record in &records {
                if self.upsert_record(record).await {
                    indexed += 1;
                }
            }
        }
        info!("Rebuilt search index with {indexed} photos");
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use crate::search::{IndexError, InMemorySearchIndex, SearchQuery};
    use async_trait::async_trait;
    use chrono::Utc;
    use common_types::{Label, NewPhoto, OwnerId};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Index that can be switched off to simulate an outage.
    #[derive(Default)]
    struct Flaky {
        inner: InMemorySearchIndex,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> Result<(), IndexError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(IndexError::Unavailable("maintenance".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SearchIndex for Flaky {
        async fn upsert(&self, document: IndexDocument) -> Result<(), IndexError> {
            self.check()?;
            self.inner.upsert(document).await
        }

        async fn remove(&self, photo_id: &str) -> Result<(), IndexError> {
            self.check()?;
            self.inner.remove(photo_id).await
        }

        async fn query(&self, owner_id: OwnerId, query: &SearchQuery) -> Result<Vec<PhotoId>, IndexError> {
            self.check()?;
            self.inner.query(owner_id, query).await
        }
    }

    fn processed(photo_id: &str, owner_id: OwnerId, label: &str) -> PhotoRecord {
        let photo = NewPhoto::builder()
            .owner_id(owner_id)
            .storage_ref(format!("originals/{photo_id}.jpg"))
            .thumbnail_ref(format!("thumbs/{photo_id}.avif"))
            .build();
        let mut record = PhotoRecord::new_pending(photo_id.into(), photo, Utc::now());
        record.state = ProcessingState::Processed;
        record.labels = vec![Label {
            name: label.into(),
            confidence: 0.9,
        }];
        record
    }

    #[tokio::test]
    async fn outage_parks_writes_until_retry() -> color_eyre::Result<()> {
        let index = Arc::new(Flaky::default());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let sync = IndexSync::new(index.clone(), metadata.clone());
        let record = processed("p1", 1, "dog");
        metadata.put(record.clone()).await?;

        index.down.store(true, Ordering::SeqCst);
        assert!(!sync.upsert_record(&record).await);
        assert_eq!(sync.pending_count().await, 1);
        assert_eq!(sync.retry_pending().await?, 0);
        assert_eq!(sync.pending_count().await, 1);

        index.down.store(false, Ordering::SeqCst);
        assert_eq!(sync.retry_pending().await?, 1);
        assert_eq!(sync.pending_count().await, 0);
        let hits = index.query(1, &SearchQuery::builder().text("dog").build()).await?;
        assert_eq!(hits, ["p1"]);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_indexes_only_processed_records() -> color_eyre::Result<()> {
        let index = Arc::new(InMemorySearchIndex::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.put(processed("p1", 1, "dog")).await?;
        metadata.put(processed("p2", 2, "cat")).await?;
        let mut pending = processed("p3", 1, "dog");
        pending.state = ProcessingState::Pending;
        metadata.put(pending).await?;

        let sync = IndexSync::new(index.clone(), metadata);
        assert_eq!(sync.rebuild().await?, 2);
        assert_eq!(index.len().await, 2);
        assert!(index.document("p3").await.is_none());
        Ok(())
    }
}
