use crate::context::WorkerContext;
use color_eyre::Result;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retries search index writes that failed while the index was unavailable.
pub async fn run_reindex_loop(context: Arc<WorkerContext>, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = interval(context.settings.pipeline.reindex_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Reindex loop stopping.");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }
        if let Err(err) = context.index.retry_pending().await {
            warn!("Reindexing parked photos failed: {err}");
        }
    }
}
