use crate::context::WorkerContext;
use color_eyre::Result;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs the clustering merge pass every `clustering.merge_interval_secs`.
pub async fn run_merge_loop(context: Arc<WorkerContext>, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = interval(context.settings.clustering.merge_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Merge loop stopping.");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }
        match context.engine.run_merge_pass().await {
            Ok(report) => info!(
                "Merge pass done: {} merged, {} deferred, {} pending reassignments",
                report.merged,
                report.deferred,
                context.engine.pending_reassignments().await
            ),
            Err(err) => error!("Merge pass failed: {err}"),
        }
    }
}
