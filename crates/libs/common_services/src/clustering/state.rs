use super::centroid_index::{sort_neighbors, CentroidIndex, Neighbor};
use super::StoredClusters;
use common_types::{cosine_distance, FaceRef, OwnerId, PersonCluster, PersonId};
use std::collections::{BTreeMap, HashMap};

/// Live clusters of one owner plus a reverse index from face to person.
#[derive(Debug, Clone, Default)]
pub struct OwnerClusters {
    clusters: BTreeMap<PersonId, PersonCluster>,
    members: HashMap<FaceRef, PersonId>,
}

impl OwnerClusters {
    #[must_use]
    pub fn get(&self, person_id: &str) -> Option<&PersonCluster> {
        self.clusters.get(person_id)
    }

    #[must_use]
    pub fn person_of(&self, face: &FaceRef) -> Option<&PersonId> {
        self.members.get(face)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersonCluster> {
        self.clusters.values()
    }

    #[must_use]
    pub fn total_members(&self) -> i64 {
        self.clusters.values().map(|c| c.member_count).sum()
    }

    /// Inserts or replaces a cluster and indexes its members.
    pub(crate) fn upsert(&mut self, cluster: PersonCluster) {
        for face in &cluster.member_refs {
            self.members.insert(face.clone(), cluster.person_id.clone());
        }
        self.clusters.insert(cluster.person_id.clone(), cluster);
    }

    pub(crate) fn remove(&mut self, person_id: &str) -> Option<PersonCluster> {
        let cluster = self.clusters.remove(person_id)?;
        for face in &cluster.member_refs {
            if self.members.get(face).is_some_and(|p| p == person_id) {
                self.members.remove(face);
            }
        }
        Some(cluster)
    }
}

impl CentroidIndex for OwnerClusters {
    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut neighbors: Vec<Neighbor> = self
            .clusters
            .values()
            .map(|cluster| Neighbor {
                person_id: cluster.person_id.clone(),
                distance: cosine_distance(query, &cluster.centroid),
            })
            .collect();
        sort_neighbors(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    fn len(&self) -> usize {
        self.clusters.len()
    }
}

/// A record rewrite that failed after its merge was committed.
#[derive(Debug, Clone)]
pub(crate) struct PendingReassignment {
    pub owner_id: OwnerId,
    pub from: PersonId,
    pub to: PersonId,
    pub members: Vec<FaceRef>,
}

/// One owner's clusters and merge redirects, guarded by that owner's mutex.
#[derive(Debug, Default)]
pub(crate) struct OwnerState {
    pub clusters: OwnerClusters,
    pub redirects: HashMap<PersonId, PersonId>,
}

impl OwnerState {
    /// Splits stored clusters and redirects by owner.
    pub fn group_stored(stored: StoredClusters) -> HashMap<OwnerId, Self> {
        let mut owners: HashMap<OwnerId, Self> = HashMap::new();
        for cluster in stored.clusters {
            owners.entry(cluster.owner_id).or_default().clusters.upsert(cluster);
        }
        for redirect in stored.redirects {
            owners
                .entry(redirect.owner_id)
                .or_default()
                .redirects
                .insert(redirect.person_id, redirect.merged_into);
        }
        owners
    }

    /// Folds `absorbed_id` into the already merged `survivor`.
    pub fn commit_merge(&mut self, survivor: PersonCluster, absorbed_id: &PersonId) {
        self.clusters.remove(absorbed_id);
        let survivor_id = survivor.person_id.clone();
        self.clusters.upsert(survivor);

        for target in self.redirects.values_mut() {
            if target == absorbed_id {
                target.clone_from(&survivor_id);
            }
        }
        self.redirects.insert(absorbed_id.clone(), survivor_id);
    }

    /// Follows redirects to a live cluster id.
    pub fn resolve(&self, person_id: &str) -> Option<PersonId> {
        let mut current = person_id.to_string();
        // Redirects are flattened on every merge, so one hop is the norm.
        for _ in 0..=self.redirects.len() {
            if self.clusters.get(&current).is_some() {
                return Some(current);
            }
            current = self.redirects.get(&current)?.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str, centroid: &[f32]) -> PersonCluster {
        PersonCluster::seeded(id.into(), 1, FaceRef::new(format!("photo-{id}"), 0), centroid)
    }

    #[test]
    fn nearest_orders_by_distance_then_id() {
        let mut owner = OwnerClusters::default();
        owner.upsert(cluster("b", &[1.0, 0.0]));
        owner.upsert(cluster("a", &[1.0, 0.0]));
        owner.upsert(cluster("c", &[0.0, 1.0]));

        let found = owner.nearest(&[1.0, 0.1], 2);
        let ids: Vec<_> = found.iter().map(|n| n.person_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(found[0].distance < 0.01);
        assert_eq!(owner.len(), 3);
    }

    #[test]
    fn merge_moves_members_and_flattens_redirects() {
        let mut state = OwnerState::default();
        let mut survivor = cluster("keep", &[1.0, 0.0]);
        let absorbed = cluster("gone", &[1.0, 0.05]);
        state.clusters.upsert(survivor.clone());
        state.clusters.upsert(absorbed.clone());
        state.redirects.insert("older".into(), "gone".into());

        survivor.absorb(&absorbed);
        state.commit_merge(survivor, &"gone".to_string());

        let owner = &state.clusters;
        assert!(owner.get("gone").is_none());
        assert_eq!(owner.person_of(&FaceRef::new("photo-gone", 0)).map(String::as_str), Some("keep"));
        assert_eq!(owner.total_members(), 2);
        assert_eq!(state.resolve("gone").as_deref(), Some("keep"));
        assert_eq!(state.resolve("older").as_deref(), Some("keep"));
        assert_eq!(state.resolve("never-existed"), None);
    }
}
