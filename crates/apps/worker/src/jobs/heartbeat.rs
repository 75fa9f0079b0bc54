use common_services::lease::{Lease, LeaseError, LeaseManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keeps a processing lease alive while a photo is being worked on.
pub struct LeaseHeartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    /// Extends `lease` to `ttl` every `every` until stopped or the lease is lost.
    #[must_use]
    pub fn start(leases: Arc<dyn LeaseManager>, lease: Lease, every: Duration, ttl: Duration) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let lost = CancellationToken::new();
        let lost_signal = lost.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the lease was just acquired.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match leases.extend(&lease, ttl).await {
                    Ok(()) => debug!("Extended lease on photo {}", lease.photo_id),
                    Err(err @ LeaseError::Lost(_)) => {
                        warn!("Stopping heartbeat: {err}");
                        lost_signal.cancel();
                        break;
                    }
                    Err(err) => warn!("Lease heartbeat for photo {} failed: {err}", lease.photo_id),
                }
            }
        });
        Self { stop, lost, handle }
    }

    /// Cancelled once another worker has taken the lease over. Results must
    /// not be written after that.
    #[must_use]
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!("Lease heartbeat task ended abnormally: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_services::lease::MemoryLeaseManager;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_outlives_the_ttl() -> color_eyre::Result<()> {
        let leases: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());
        let ttl = Duration::from_secs(3);
        let lease = leases.try_acquire("p1", ttl).await?.ok_or_else(|| color_eyre::eyre::eyre!("not acquired"))?;

        let heartbeat = LeaseHeartbeat::start(leases.clone(), lease.clone(), Duration::from_secs(1), ttl);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(leases.try_acquire("p1", ttl).await?.is_none());

        assert!(!heartbeat.lost().is_cancelled());
        heartbeat.stop().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(leases.try_acquire("p1", ttl).await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_signals_lost_lease() -> color_eyre::Result<()> {
        let leases: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());
        let ttl = Duration::from_secs(3);
        let lease = leases.try_acquire("p1", ttl).await?.ok_or_else(|| color_eyre::eyre::eyre!("not acquired"))?;

        let heartbeat = LeaseHeartbeat::start(leases.clone(), lease.clone(), Duration::from_secs(1), ttl);
        leases.release(&lease).await?;
        let other = leases.try_acquire("p1", ttl).await?;
        assert!(other.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(heartbeat.lost().is_cancelled());
        heartbeat.stop().await;
        Ok(())
    }
}
