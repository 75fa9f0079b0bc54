use super::{new_token, Lease, LeaseError, LeaseManager};
use async_trait::async_trait;
use common_types::PhotoId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Held {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryLeaseManager {
    leases: Mutex<HashMap<PhotoId, Held>>,
}

impl MemoryLeaseManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn try_acquire(&self, photo_id: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if leases.get(photo_id).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }
        let token = new_token();
        leases.insert(
            photo_id.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(Lease {
            photo_id: photo_id.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.photo_id) {
            Some(held) if held.token == lease.token => {
                held.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(LeaseError::Lost(lease.photo_id.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&lease.photo_id)
            .is_some_and(|held| held.token == lease.token)
        {
            leases.remove(&lease.photo_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn second_acquire_is_refused_while_held() -> color_eyre::Result<()> {
        let leases = MemoryLeaseManager::new();
        let first = leases.try_acquire("p1", TTL).await?;
        assert!(first.is_some());
        assert!(leases.try_acquire("p1", TTL).await?.is_none());
        assert!(leases.try_acquire("p2", TTL).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn at_most_one_concurrent_holder() -> color_eyre::Result<()> {
        let leases = Arc::new(MemoryLeaseManager::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let leases = Arc::clone(&leases);
            handles.push(tokio::spawn(async move { leases.try_acquire("p1", TTL).await }));
        }
        let mut holders = 0;
        for handle in handles {
            if handle.await??.is_some() {
                holders += 1;
            }
        }
        assert_eq!(holders, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_taken_over_and_old_token_is_dead() -> color_eyre::Result<()> {
        let leases = MemoryLeaseManager::new();
        let Some(old) = leases.try_acquire("p1", TTL).await? else {
            return Err(color_eyre::eyre::eyre!("first acquire refused"));
        };

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let Some(new) = leases.try_acquire("p1", TTL).await? else {
            return Err(color_eyre::eyre::eyre!("takeover refused"));
        };
        assert_ne!(old.token, new.token);

        assert!(matches!(leases.extend(&old, TTL).await, Err(LeaseError::Lost(_))));
        leases.release(&old).await?;
        assert!(leases.try_acquire("p1", TTL).await?.is_none());

        leases.release(&new).await?;
        assert!(leases.try_acquire("p1", TTL).await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn extend_keeps_lease_alive() -> color_eyre::Result<()> {
        let leases = MemoryLeaseManager::new();
        let Some(lease) = leases.try_acquire("p1", TTL).await? else {
            return Err(color_eyre::eyre::eyre!("acquire refused"));
        };
        tokio::time::advance(Duration::from_secs(50)).await;
        leases.extend(&lease, TTL).await?;
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(leases.try_acquire("p1", TTL).await?.is_none());
        Ok(())
    }
}
