use crate::metadata::{MetadataStore, PhotoFilter, StoreError};
use crate::queue::{QueueError, TaskQueue};
use crate::utils::{nice_id, PHOTO_ID_LENGTH};
use chrono::Utc;
use common_types::{IngestionTask, NewPhoto, OwnerId, PhotoRecord, ProcessingState};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Records a freshly uploaded photo as `Pending` and queues its analysis.
///
/// The record is written before the task, so a worker never sees a task for a
/// photo that does not exist yet.
pub async fn submit_upload(
    store: &dyn MetadataStore,
    queue: &dyn TaskQueue,
    photo: NewPhoto,
) -> Result<PhotoRecord, UploadError> {
    let record = PhotoRecord::new_pending(nice_id(PHOTO_ID_LENGTH), photo, Utc::now());
    store.put(record.clone()).await?;
    queue.enqueue(IngestionTask::new(record.photo_id.clone())).await?;
    info!(
        "Accepted upload {} for owner {} ({})",
        record.photo_id, record.owner_id, record.storage_ref
    );
    Ok(record)
}

/// Gives every `Failed` photo of an owner a fresh retry budget and queues it
/// again. Returns the number of photos queued.
pub async fn requeue_failed(
    store: &dyn MetadataStore,
    queue: &dyn TaskQueue,
    owner_id: OwnerId,
) -> Result<usize, UploadError> {
    let failed = store
        .list(owner_id, &PhotoFilter::in_state(ProcessingState::Failed))
        .await?;
    for record in &failed {
        store
            .update(
                &record.photo_id,
                Box::new(|r: &mut PhotoRecord| -> Result<(), StoreError> {
                    r.retry_count = 0;
                    Ok(())
                }),
            )
            .await?;
        queue
            .enqueue(IngestionTask::new(record.photo_id.clone()))
            .await?;
    }
    info!("Requeued {} failed photos of owner {owner_id}", failed.len());
    Ok(failed.len())
}
