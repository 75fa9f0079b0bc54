use crate::backoff::backoff_delay;
use crate::context::WorkerContext;
use crate::handlers::TaskOutcome;
use crate::jobs::heartbeat::LeaseHeartbeat;
use chrono::Utc;
use color_eyre::Result;
use common_services::alert;
use common_services::metadata::StoreError;
use common_types::{
    ClassificationResult, ClassifierError, IngestionTask, PhotoRecord, ProcessingState,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs one ingestion task through the processing state machine.
///
/// An `Err` means a backend failed midway; the task is then left unacked so
/// the queue redelivers it.
pub async fn handle(context: &WorkerContext, task: &IngestionTask) -> Result<TaskOutcome> {
    let pipeline = &context.settings.pipeline;
    let Some(lease) = context
        .leases
        .try_acquire(&task.photo_id, pipeline.lease_ttl)
        .await?
    else {
        debug!("Photo {} is leased by another worker, requeueing", task.photo_id);
        return Ok(TaskOutcome::Requeue(pipeline.lease_conflict_delay));
    };

    let heartbeat = LeaseHeartbeat::start(
        context.leases.clone(),
        lease.clone(),
        pipeline.lease_heartbeat,
        pipeline.lease_ttl,
    );
    let outcome = process_leased(context, task, &heartbeat.lost()).await;
    heartbeat.stop().await;

    if let Err(err) = context.leases.release(&lease).await {
        warn!("Could not release lease on photo {}: {err}", task.photo_id);
    }
    outcome
}

async fn process_leased(
    context: &WorkerContext,
    task: &IngestionTask,
    lease_lost: &CancellationToken,
) -> Result<TaskOutcome> {
    let record = match context.metadata.get(&task.photo_id).await {
        Ok(record) => record,
        Err(StoreError::NotFound(_)) => {
            warn!("Dropping task for unknown photo {}", task.photo_id);
            return Ok(TaskOutcome::Ack);
        }
        Err(err) => return Err(err.into()),
    };

    if record.state == ProcessingState::Processed {
        debug!("Photo {} already processed, finalizing only", record.photo_id);
        finalize(context, &record).await?;
        return Ok(TaskOutcome::Ack);
    }
    if record.state == ProcessingState::Failed && record.retry_count > context.settings.pipeline.max_retries {
        debug!("Photo {} already failed for good, dropping redelivered task", record.photo_id);
        return Ok(TaskOutcome::Ack);
    }

    let record = context
        .metadata
        .update(
            &task.photo_id,
            Box::new(|r: &mut PhotoRecord| -> Result<(), StoreError> {
                r.transition(ProcessingState::Processing)?;
                Ok(())
            }),
        )
        .await?;

    let classified = timeout(
        context.settings.pipeline.classifier_timeout,
        context.classifier.classify(&record.storage_ref),
    )
    .await
    .unwrap_or(Err(ClassifierError::Timeout));

    if lease_lost.is_cancelled() {
        warn!(
            "Lease on photo {} was taken over while classifying, leaving it to the new holder",
            record.photo_id
        );
        return Ok(TaskOutcome::Requeue(context.settings.pipeline.lease_conflict_delay));
    }

    match classified {
        Ok(result) => match result.validate(context.settings.clustering.embedding_dimension) {
            Ok(()) => complete(context, &record, result).await,
            Err(err) => fail_permanently(context, &record, format!("invalid classifier response: {err}")).await,
        },
        Err(err) => retry_or_fail(context, &record, err).await,
    }
}

async fn complete(
    context: &WorkerContext,
    record: &PhotoRecord,
    result: ClassificationResult,
) -> Result<TaskOutcome> {
    let processed = context
        .metadata
        .update(
            &record.photo_id,
            Box::new(move |r: &mut PhotoRecord| -> Result<(), StoreError> {
                r.apply_classification(&result);
                r.mark_processed(Utc::now())?;
                Ok(())
            }),
        )
        .await?;
    finalize(context, &processed).await?;
    info!(
        "Processed photo {}: {} labels, {} faces",
        processed.photo_id,
        processed.labels.len(),
        processed.faces.len()
    );
    Ok(TaskOutcome::Ack)
}

/// Steps that are safe to repeat for a processed photo.
async fn finalize(context: &WorkerContext, record: &PhotoRecord) -> Result<()> {
    context.index.upsert_record(record).await;
    let assigned = context.engine.assign_photo(&record.photo_id).await?;
    if !assigned.is_empty() {
        debug!("Photo {}: {} faces assigned to people", record.photo_id, assigned.len());
    }
    Ok(())
}

async fn retry_or_fail(
    context: &WorkerContext,
    record: &PhotoRecord,
    error: ClassifierError,
) -> Result<TaskOutcome> {
    let pipeline = &context.settings.pipeline;
    let max_retries = pipeline.max_retries;
    let reason = error.to_string();
    let updated = context
        .metadata
        .update(
            &record.photo_id,
            Box::new(move |r: &mut PhotoRecord| -> Result<(), StoreError> {
                r.retry_count += 1;
                if r.retry_count > max_retries {
                    r.mark_failed(reason)?;
                } else {
                    r.transition(ProcessingState::Pending)?;
                    r.last_error = Some(reason);
                }
                Ok(())
            }),
        )
        .await?;

    if updated.state == ProcessingState::Failed {
        alert!(
            "Photo {} failed after {} attempts: {error}",
            updated.photo_id,
            updated.retry_count
        );
        return Ok(TaskOutcome::Ack);
    }

    let delay = backoff_delay(pipeline.backoff_base, pipeline.backoff_cap, updated.retry_count);
    warn!(
        "Classifying photo {} failed ({error}), retry {} in {delay:?}",
        updated.photo_id, updated.retry_count
    );
    Ok(TaskOutcome::Requeue(delay))
}

async fn fail_permanently(
    context: &WorkerContext,
    record: &PhotoRecord,
    reason: String,
) -> Result<TaskOutcome> {
    let message = reason.clone();
    let exhausted = context.settings.pipeline.max_retries.saturating_add(1);
    context
        .metadata
        .update(
            &record.photo_id,
            Box::new(move |r: &mut PhotoRecord| -> Result<(), StoreError> {
                // Not retried, so the retry budget counts as spent.
                r.retry_count = r.retry_count.max(exhausted);
                r.mark_failed(message)?;
                Ok(())
            }),
        )
        .await?;
    alert!("Photo {} failed: {reason}", record.photo_id);
    Ok(TaskOutcome::Ack)
}
