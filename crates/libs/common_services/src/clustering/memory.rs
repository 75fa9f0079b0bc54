use super::{ClusterError, ClusterStore, Redirect, StoredClusters};
use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonCluster, PersonId};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Stored {
    clusters: HashMap<PersonId, PersonCluster>,
    redirects: HashMap<PersonId, Redirect>,
}

impl Stored {
    fn snapshot(&self, owner: Option<OwnerId>) -> StoredClusters {
        let wanted = |owner_id: OwnerId| owner.is_none_or(|o| o == owner_id);
        let mut clusters: Vec<PersonCluster> = self
            .clusters
            .values()
            .filter(|c| wanted(c.owner_id))
            .cloned()
            .collect();
        clusters.sort_by(|a, b| a.person_id.cmp(&b.person_id));
        let mut redirects: Vec<Redirect> = self
            .redirects
            .values()
            .filter(|r| wanted(r.owner_id))
            .cloned()
            .collect();
        redirects.sort_by(|a, b| a.person_id.cmp(&b.person_id));
        StoredClusters {
            clusters,
            redirects,
        }
    }

    fn version_of(&self, person_id: &str) -> Option<i64> {
        self.clusters.get(person_id).map(|c| c.version)
    }
}

/// Keeps clusters in process memory. Surviving a restart requires the
/// Postgres store; this one lets tests reload an engine, or run two engines,
/// over the same instance.
#[derive(Debug, Default)]
pub struct MemoryClusterStore {
    inner: Mutex<Stored>,
}

impl MemoryClusterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn load(&self) -> Result<StoredClusters, ClusterError> {
        Ok(self.inner.lock().await.snapshot(None))
    }

    async fn load_owner(&self, owner_id: OwnerId) -> Result<StoredClusters, ClusterError> {
        Ok(self.inner.lock().await.snapshot(Some(owner_id)))
    }

    async fn record_assignment(
        &self,
        cluster: &PersonCluster,
        _member: &FaceRef,
        expected_version: Option<i64>,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().await;
        if inner.version_of(&cluster.person_id) != expected_version
            || inner.redirects.contains_key(&cluster.person_id)
        {
            return Err(ClusterError::Stale(cluster.person_id.clone()));
        }
        inner
            .clusters
            .insert(cluster.person_id.clone(), cluster.clone());
        Ok(())
    }

    async fn commit_merge(
        &self,
        survivor: &PersonCluster,
        survivor_version: i64,
        absorbed: &PersonCluster,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().await;
        if inner.version_of(&survivor.person_id) != Some(survivor_version) {
            return Err(ClusterError::Stale(survivor.person_id.clone()));
        }
        if inner.version_of(&absorbed.person_id) != Some(absorbed.version) {
            return Err(ClusterError::Stale(absorbed.person_id.clone()));
        }

        inner.clusters.remove(&absorbed.person_id);
        inner
            .clusters
            .insert(survivor.person_id.clone(), survivor.clone());
        for redirect in inner.redirects.values_mut() {
            if redirect.merged_into == absorbed.person_id {
                redirect.merged_into.clone_from(&survivor.person_id);
            }
        }
        inner.redirects.insert(
            absorbed.person_id.clone(),
            Redirect {
                owner_id: absorbed.owner_id,
                person_id: absorbed.person_id.clone(),
                merged_into: survivor.person_id.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str, owner_id: OwnerId) -> PersonCluster {
        PersonCluster::seeded(id.into(), owner_id, FaceRef::new(format!("photo-{id}"), 0), &[1.0, 0.0])
    }

    #[tokio::test]
    async fn writes_against_an_old_version_are_rejected() -> color_eyre::Result<()> {
        let store = MemoryClusterStore::new();
        let mut person = cluster("a", 1);
        store.record_assignment(&person, &FaceRef::new("photo-a", 0), None).await?;

        // A second creation of the same id is stale.
        let again = store.record_assignment(&person, &FaceRef::new("photo-a", 0), None).await;
        assert!(matches!(again, Err(ClusterError::Stale(id)) if id == "a"));

        person.add_member(FaceRef::new("p2", 0), &[1.0, 0.0]);
        store.record_assignment(&person, &FaceRef::new("p2", 0), Some(1)).await?;
        let old = store.record_assignment(&person, &FaceRef::new("p3", 0), Some(1)).await;
        assert!(matches!(old, Err(ClusterError::Stale(_))));
        assert_eq!(store.load().await?.clusters[0].version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn merged_away_clusters_cannot_be_written() -> color_eyre::Result<()> {
        let store = MemoryClusterStore::new();
        let keep = cluster("keep", 1);
        let gone = cluster("gone", 1);
        let other = cluster("other", 2);
        for person in [&keep, &gone, &other] {
            let face = FaceRef::new(format!("photo-{}", person.person_id), 0);
            store.record_assignment(person, &face, None).await?;
        }

        let mut survivor = keep.clone();
        survivor.absorb(&gone);
        store.commit_merge(&survivor, keep.version, &gone).await?;

        let mut revived = gone.clone();
        revived.add_member(FaceRef::new("p9", 0), &[1.0, 0.0]);
        let write = store.record_assignment(&revived, &FaceRef::new("p9", 0), Some(gone.version)).await;
        assert!(matches!(write, Err(ClusterError::Stale(id)) if id == "gone"));

        let owner = store.load_owner(1).await?;
        assert_eq!(owner.clusters.len(), 1);
        assert_eq!(owner.clusters[0].member_count, 2);
        assert_eq!(owner.redirects[0].merged_into, "keep");
        assert!(store.load_owner(2).await?.redirects.is_empty());
        Ok(())
    }
}
