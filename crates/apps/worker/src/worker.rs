use crate::context::WorkerContext;
use crate::handlers::merge_pass::run_merge_loop;
use crate::handlers::reindex::run_reindex_loop;
use crate::handlers::{process_photo, TaskOutcome};
use color_eyre::Result;
use common_services::queue::{QueueError, QueuedTask};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Starts `pipeline.workers` worker loops plus the merge and reindex loops,
/// and waits until all of them stop.
pub async fn run_pipeline(context: Arc<WorkerContext>, shutdown: CancellationToken) -> Result<()> {
    info!(
        "🛠️ [Worker ID: {}] Starting {} workers.",
        context.worker_id, context.settings.pipeline.workers
    );
    context.engine.repair_redirected_faces().await?;
    context.assign_unclustered().await?;

    let mut tasks = JoinSet::new();
    for worker_index in 0..context.settings.pipeline.workers {
        tasks.spawn(run_worker_loop(context.clone(), worker_index, shutdown.clone()));
    }
    tasks.spawn(run_merge_loop(context.clone(), shutdown.clone()));
    tasks.spawn(run_reindex_loop(context.clone(), shutdown.clone()));

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    info!("[Worker ID: {}] Stopped.", context.worker_id);
    Ok(())
}

/// The main loop for one worker, continuously taking tasks off the queue.
///
/// Stops when `shutdown` fires or the queue is closed. A task already taken
/// is finished first.
pub async fn run_worker_loop(
    context: Arc<WorkerContext>,
    worker_index: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let dequeued = tokio::select! {
            () = shutdown.cancelled() => break,
            dequeued = context.queue.dequeue() => dequeued,
        };
        match dequeued {
            Ok(queued) => {
                info!(
                    "🐜 Worker {worker_index} picked up photo {} (attempt {})",
                    queued.task.photo_id, queued.task.attempt_count
                );
                if let Err(err) = process_task(&context, &queued).await {
                    error!(
                        "Task for photo {} left for redelivery: {err:?}",
                        queued.task.photo_id
                    );
                }
            }
            Err(QueueError::Closed) => break,
            Err(err) => {
                error!("Dequeue failed: {err}");
                sleep(context.settings.pipeline.poll_interval).await;
            }
        }
    }
    info!("Worker {worker_index} stopping.");
    Ok(())
}

/// Handles one delivery and settles it with the queue.
pub async fn process_task(context: &WorkerContext, queued: &QueuedTask) -> Result<TaskOutcome> {
    let outcome = process_photo::handle(context, &queued.task).await?;
    match outcome {
        TaskOutcome::Ack => context.queue.ack(queued.receipt).await?,
        TaskOutcome::Requeue(delay) => context.queue.nack(queued.receipt, delay).await?,
    }
    Ok(outcome)
}
