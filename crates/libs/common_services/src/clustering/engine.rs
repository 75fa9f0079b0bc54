use super::centroid_index::CentroidIndex;
use super::state::{OwnerState, PendingReassignment};
use super::{ClusterError, ClusterStore};
use crate::alert;
use crate::metadata::{MetadataStore, PhotoFilter, StoreError};
use crate::utils::{nice_id, PERSON_ID_LENGTH};
use app_state::ClusteringSettings;
use common_types::{
    cosine_distance, validate_embedding, FaceRef, OwnerId, PersonCluster, PersonId, PhotoRecord,
};
use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of one merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    /// Merges skipped because their clusters kept changing; retried next pass.
    pub deferred: usize,
    pub reassigned_faces: usize,
}

impl AddAssign for MergeReport {
    fn add_assign(&mut self, other: Self) {
        self.merged += other.merged;
        self.deferred += other.deferred;
        self.reassigned_faces += other.reassigned_faces;
    }
}

#[derive(Debug, Clone)]
struct MergeCandidate {
    a: PersonId,
    a_version: i64,
    b: PersonId,
    b_version: i64,
    distance: f32,
}

enum MergeOutcome {
    Merged { reassigned: usize },
    /// One side no longer exists, usually because an earlier merge absorbed it.
    Gone,
    Conflict,
}

type OwnerSlot = Arc<Mutex<OwnerState>>;

/// Owns every person cluster. Each owner's clusters sit behind their own
/// async mutex, so owners cluster independently while assignments and merges
/// within one owner are serialized together with their record writes.
pub struct FaceClusterEngine {
    owners: RwLock<HashMap<OwnerId, OwnerSlot>>,
    pending: Mutex<Vec<PendingReassignment>>,
    /// Set when records may still name people that were merged away.
    repair_due: AtomicBool,
    store: Arc<dyn ClusterStore>,
    metadata: Arc<dyn MetadataStore>,
    settings: ClusteringSettings,
}

impl FaceClusterEngine {
    /// Builds the engine from whatever the cluster store holds.
    pub async fn load(
        store: Arc<dyn ClusterStore>,
        metadata: Arc<dyn MetadataStore>,
        settings: ClusteringSettings,
    ) -> Result<Self, ClusterError> {
        let stored = store.load().await?;
        let cluster_count = stored.clusters.len();
        let owners: HashMap<OwnerId, OwnerSlot> = OwnerState::group_stored(stored)
            .into_iter()
            .map(|(owner_id, state)| (owner_id, Arc::new(Mutex::new(state))))
            .collect();
        info!(
            "Loaded {cluster_count} person clusters for {} owners",
            owners.len()
        );
        Ok(Self {
            owners: RwLock::new(owners),
            pending: Mutex::new(Vec::new()),
            repair_due: AtomicBool::new(true),
            store,
            metadata,
            settings,
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &ClusteringSettings {
        &self.settings
    }

    async fn owner_slot(&self, owner_id: OwnerId) -> OwnerSlot {
        if let Some(slot) = self.owners.read().await.get(&owner_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.owners.write().await.entry(owner_id).or_default())
    }

    async fn all_slots(&self) -> Vec<OwnerSlot> {
        self.owners.read().await.values().cloned().collect()
    }

    /// Assigns one face to a person, creating the person if no centroid is
    /// close enough. Inserting a face that is already a member returns its
    /// current person.
    pub async fn insert_face(
        &self,
        owner_id: OwnerId,
        face: FaceRef,
        embedding: &[f32],
    ) -> Result<PersonId, ClusterError> {
        validate_embedding(embedding, self.settings.embedding_dimension)?;
        let slot = self.owner_slot(owner_id).await;
        let mut state = slot.lock().await;
        self.assign_or_reload(&mut state, owner_id, &face, embedding).await
    }

    /// Clusters every face of the photo that has no person yet and writes the
    /// resulting person ids onto the record.
    pub async fn assign_photo(&self, photo_id: &str) -> Result<Vec<(usize, PersonId)>, ClusterError> {
        let record = self.metadata.get(photo_id).await?;
        let slot = self.owner_slot(record.owner_id).await;
        let mut state = slot.lock().await;

        let mut assigned: Vec<(usize, PersonId, Vec<f32>)> = Vec::new();
        for (index, face) in record.unassigned_faces() {
            let Ok(face_index) = i32::try_from(index) else {
                continue;
            };
            if let Err(err) = validate_embedding(&face.embedding, self.settings.embedding_dimension) {
                warn!("Skipping face {index} of photo {photo_id}: {err}");
                continue;
            }
            let person_id = self
                .assign_or_reload(
                    &mut state,
                    record.owner_id,
                    &FaceRef::new(photo_id, face_index),
                    &face.embedding,
                )
                .await?;
            assigned.push((index, person_id, face.embedding.clone()));
        }
        if assigned.is_empty() {
            return Ok(Vec::new());
        }

        // Still under the owner lock, so no merge can slip in between.
        let writes = assigned.clone();
        self.metadata
            .update(
                photo_id,
                Box::new(move |record: &mut PhotoRecord| -> Result<(), StoreError> {
                    for (index, person_id, embedding) in writes {
                        if let Some(face) = record.faces.get_mut(index)
                            && face.person_id.is_none()
                            && face.embedding == embedding
                        {
                            face.person_id = Some(person_id);
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        debug!("Assigned {} faces of photo {photo_id}", assigned.len());
        Ok(assigned
            .into_iter()
            .map(|(index, person_id, _)| (index, person_id))
            .collect())
    }

    /// Assigns a face; if another engine changed the chosen cluster in the
    /// store, reloads the owner's clusters and assigns once more.
    async fn assign_or_reload(
        &self,
        state: &mut OwnerState,
        owner_id: OwnerId,
        face: &FaceRef,
        embedding: &[f32],
    ) -> Result<PersonId, ClusterError> {
        match self.assign_locked(state, owner_id, face, embedding).await {
            Err(ClusterError::Stale(person_id)) => {
                warn!("Person {person_id} changed in the store, reloading people of owner {owner_id}");
                self.reload_owner(state, owner_id).await?;
                self.assign_locked(state, owner_id, face, embedding).await
            }
            other => other,
        }
    }

    async fn reload_owner(&self, state: &mut OwnerState, owner_id: OwnerId) -> Result<(), ClusterError> {
        let stored = self.store.load_owner(owner_id).await?;
        *state = OwnerState::group_stored(stored)
            .remove(&owner_id)
            .unwrap_or_default();
        self.repair_due.store(true, Ordering::Release);
        Ok(())
    }

    async fn assign_locked(
        &self,
        state: &mut OwnerState,
        owner_id: OwnerId,
        face: &FaceRef,
        embedding: &[f32],
    ) -> Result<PersonId, ClusterError> {
        let owner = &mut state.clusters;
        if let Some(existing) = owner.person_of(face) {
            return Ok(existing.clone());
        }

        let nearest = owner.nearest(embedding, 1).into_iter().next();
        let (cluster, expected_version) = match nearest {
            Some(neighbor) if neighbor.distance < self.settings.match_threshold => {
                let mut cluster = owner
                    .get(&neighbor.person_id)
                    .cloned()
                    .ok_or_else(|| ClusterError::UnknownPerson(neighbor.person_id.clone()))?;
                let expected_version = cluster.version;
                cluster.add_member(face.clone(), embedding);
                debug!(
                    "Face {}#{} joins {} at distance {:.3}",
                    face.photo_id, face.face_index, cluster.person_id, neighbor.distance
                );
                (cluster, Some(expected_version))
            }
            _ => {
                if owner.len() == self.settings.max_exact_scan_clusters {
                    warn!(
                        "Owner {owner_id} now has more than {} people; centroid lookup is an exact scan",
                        self.settings.max_exact_scan_clusters
                    );
                }
                let cluster = PersonCluster::seeded(
                    nice_id(PERSON_ID_LENGTH),
                    owner_id,
                    face.clone(),
                    embedding,
                );
                debug!(
                    "Face {}#{} starts new person {}",
                    face.photo_id, face.face_index, cluster.person_id
                );
                (cluster, None)
            }
        };

        self.store
            .record_assignment(&cluster, face, expected_version)
            .await?;
        let person_id = cluster.person_id.clone();
        owner.upsert(cluster);
        Ok(person_id)
    }

    /// Merges clusters of every owner whose centroids are closer than the
    /// merge threshold.
    pub async fn run_merge_pass(&self) -> Result<MergeReport, ClusterError> {
        let mut report = MergeReport::default();
        if self.repair_due.load(Ordering::Acquire) {
            match self.repair_redirected_faces().await {
                Ok(repaired) => report.reassigned_faces += repaired,
                Err(err) => warn!("Repairing faces of merged people failed, will retry: {err}"),
            }
        }
        report.reassigned_faces += self.retry_pending_reassignments().await;

        let owners: Vec<OwnerId> = self.owners.read().await.keys().copied().collect();
        for owner_id in owners {
            report += self.merge_owner(owner_id).await?;
        }
        if report.merged > 0 || report.deferred > 0 || report.reassigned_faces > 0 {
            info!(
                "Merge pass: {} merged, {} deferred, {} faces reassigned",
                report.merged, report.deferred, report.reassigned_faces
            );
        }
        Ok(report)
    }

    /// Compares centroids on a snapshot, then applies each merge under the
    /// owner's lock only if neither cluster changed in between.
    pub async fn merge_owner(&self, owner_id: OwnerId) -> Result<MergeReport, ClusterError> {
        let slot = self.owner_slot(owner_id).await;
        let snapshot: Vec<PersonCluster> = slot.lock().await.clusters.iter().cloned().collect();

        let mut report = MergeReport::default();
        for candidate in merge_candidates(&snapshot, self.settings.merge_threshold) {
            match self.apply_merge(&slot, owner_id, &candidate).await? {
                MergeOutcome::Merged { reassigned } => {
                    report.merged += 1;
                    report.reassigned_faces += reassigned;
                }
                MergeOutcome::Gone => {}
                MergeOutcome::Conflict => {
                    let Some(fresh) = self.refresh_candidate(&slot, &candidate).await else {
                        continue;
                    };
                    match self.apply_merge(&slot, owner_id, &fresh).await? {
                        MergeOutcome::Merged { reassigned } => {
                            report.merged += 1;
                            report.reassigned_faces += reassigned;
                        }
                        MergeOutcome::Gone => {}
                        MergeOutcome::Conflict => {
                            debug!(
                                "Deferring merge of {} and {} to the next pass",
                                candidate.a, candidate.b
                            );
                            report.deferred += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Re-reads a conflicting pair and keeps it only if it is still close enough.
    async fn refresh_candidate(
        &self,
        slot: &OwnerSlot,
        candidate: &MergeCandidate,
    ) -> Option<MergeCandidate> {
        let state = slot.lock().await;
        let a = state.clusters.get(&candidate.a)?;
        let b = state.clusters.get(&candidate.b)?;
        let distance = cosine_distance(&a.centroid, &b.centroid);
        (distance < self.settings.merge_threshold).then(|| MergeCandidate {
            a: a.person_id.clone(),
            a_version: a.version,
            b: b.person_id.clone(),
            b_version: b.version,
            distance,
        })
    }

    async fn apply_merge(
        &self,
        slot: &OwnerSlot,
        owner_id: OwnerId,
        candidate: &MergeCandidate,
    ) -> Result<MergeOutcome, ClusterError> {
        let mut state = slot.lock().await;
        let (a, b) = match (state.clusters.get(&candidate.a), state.clusters.get(&candidate.b)) {
            (Some(a), Some(b)) => (a.clone(), b.clone()),
            _ => return Ok(MergeOutcome::Gone),
        };
        if a.version != candidate.a_version || b.version != candidate.b_version {
            return Ok(MergeOutcome::Conflict);
        }

        let (mut survivor, absorbed) = pick_survivor(a, b);
        let survivor_version = survivor.version;
        survivor.absorb(&absorbed);
        match self
            .store
            .commit_merge(&survivor, survivor_version, &absorbed)
            .await
        {
            Ok(()) => {}
            Err(ClusterError::Stale(person_id)) => {
                debug!("Person {person_id} changed in the store, reloading people of owner {owner_id}");
                self.reload_owner(&mut state, owner_id).await?;
                return Ok(MergeOutcome::Conflict);
            }
            Err(err) => return Err(err),
        }

        let members: Vec<FaceRef> = absorbed.member_refs.iter().cloned().collect();
        let reassigned = match self
            .metadata
            .reassign_person(&absorbed.person_id, &survivor.person_id, &members)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                alert!(
                    "Rewriting faces of {} to {} failed, will retry: {err}",
                    absorbed.person_id,
                    survivor.person_id
                );
                self.pending.lock().await.push(PendingReassignment {
                    owner_id,
                    from: absorbed.person_id.clone(),
                    to: survivor.person_id.clone(),
                    members,
                });
                0
            }
        };

        info!(
            "Merged person {} into {} (distance {:.3}, {} members)",
            absorbed.person_id, survivor.person_id, candidate.distance, survivor.member_count
        );
        state.commit_merge(survivor, &absorbed.person_id);
        Ok(MergeOutcome::Merged { reassigned })
    }

    async fn retry_pending_reassignments(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        let mut still_failing = Vec::new();
        let mut reassigned = 0;
        for item in pending {
            let slot = self.owner_slot(item.owner_id).await;
            let state = slot.lock().await;
            let target = state.resolve(&item.to).unwrap_or_else(|| item.to.clone());
            match self
                .metadata
                .reassign_person(&item.from, &target, &item.members)
                .await
            {
                Ok(count) => reassigned += count,
                Err(err) => {
                    warn!("Rewriting faces of {} still failing: {err}", item.from);
                    still_failing.push(item);
                }
            }
        }
        self.pending.lock().await.extend(still_failing);
        reassigned
    }

    /// Rewrites every face that still names a merged-away person to the live
    /// person that absorbed it. Runs on the first merge pass after a load and
    /// after any reload, so rewrites lost to a crash are not lost for good.
    pub async fn repair_redirected_faces(&self) -> Result<usize, ClusterError> {
        self.repair_due.store(false, Ordering::Release);
        let repaired = self.repair_all_owners().await;
        if repaired.is_err() {
            self.repair_due.store(true, Ordering::Release);
        }
        repaired
    }

    async fn repair_all_owners(&self) -> Result<usize, ClusterError> {
        let mut repaired = 0;
        for owner_id in self.metadata.owners().await? {
            let slot = self.owner_slot(owner_id).await;
            let state = slot.lock().await;
            if state.redirects.is_empty() {
                continue;
            }
            let records = self.metadata.list(owner_id, &PhotoFilter::default()).await?;
            for ((from, to), members) in redirected_faces(&state, &records) {
                repaired += self.metadata.reassign_person(&from, &to, &members).await?;
            }
        }
        if repaired > 0 {
            info!("Repaired {repaired} faces still pointing at merged people");
        }
        Ok(repaired)
    }

    /// Follows merge redirects to the live person an id now belongs to.
    pub async fn resolve(&self, person_id: &str) -> Option<PersonId> {
        for slot in self.all_slots().await {
            if let Some(live) = slot.lock().await.resolve(person_id) {
                return Some(live);
            }
        }
        None
    }

    /// Live people of one owner, largest first.
    pub async fn people(&self, owner_id: OwnerId) -> Vec<PersonCluster> {
        let Some(slot) = self.owners.read().await.get(&owner_id).cloned() else {
            return Vec::new();
        };
        let mut people: Vec<PersonCluster> = slot.lock().await.clusters.iter().cloned().collect();
        people.sort_by(|a, b| {
            b.member_count
                .cmp(&a.member_count)
                .then_with(|| a.person_id.cmp(&b.person_id))
        });
        people
    }

    /// Record rewrites still waiting for a retry.
    pub async fn pending_reassignments(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Faces naming a merged-away person, grouped by (old id, live id).
fn redirected_faces(
    state: &OwnerState,
    records: &[PhotoRecord],
) -> BTreeMap<(PersonId, PersonId), Vec<FaceRef>> {
    let mut rewrites: BTreeMap<(PersonId, PersonId), Vec<FaceRef>> = BTreeMap::new();
    for record in records {
        for (index, face) in record.faces.iter().enumerate() {
            let Some(person_id) = &face.person_id else {
                continue;
            };
            if !state.redirects.contains_key(person_id) {
                continue;
            }
            let (Some(live), Ok(face_index)) = (state.resolve(person_id), i32::try_from(index)) else {
                continue;
            };
            rewrites
                .entry((person_id.clone(), live))
                .or_default()
                .push(FaceRef::new(record.photo_id.clone(), face_index));
        }
    }
    rewrites
}

/// Pairs closer than `threshold`, nearest first.
fn merge_candidates(clusters: &[PersonCluster], threshold: f32) -> Vec<MergeCandidate> {
    let mut candidates = Vec::new();
    for (i, a) in clusters.iter().enumerate() {
        for b in &clusters[i + 1..] {
            let distance = cosine_distance(&a.centroid, &b.centroid);
            if distance < threshold {
                candidates.push(MergeCandidate {
                    a: a.person_id.clone(),
                    a_version: a.version,
                    b: b.person_id.clone(),
                    b_version: b.version,
                    distance,
                });
            }
        }
    }
    candidates.sort_by(|x, y| {
        x.distance
            .total_cmp(&y.distance)
            .then_with(|| x.a.cmp(&y.a))
            .then_with(|| x.b.cmp(&y.b))
    });
    candidates
}

/// The cluster with more members survives; on a tie the smaller id does.
fn pick_survivor(a: PersonCluster, b: PersonCluster) -> (PersonCluster, PersonCluster) {
    let a_wins = a.member_count > b.member_count
        || (a.member_count == b.member_count && a.person_id < b.person_id);
    if a_wins { (a, b) } else { (b, a) }
}
