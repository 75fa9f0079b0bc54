use super::{rewrite_person, MetadataStore, Mutator, PhotoFilter, StoreError};
use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonId, PhotoId, PhotoRecord};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Slot = Arc<Mutex<PhotoRecord>>;

/// In-process metadata store with one async mutex per record.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<HashMap<PhotoId, Slot>>,
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, photo_id: &str) -> Result<Slot, StoreError> {
        self.records
            .read()
            .await
            .get(photo_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(photo_id.to_string()))
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, record: PhotoRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let existing = records.get(&record.photo_id).cloned();
        match existing {
            Some(slot) => {
                drop(records);
                *slot.lock().await = record;
            }
            None => {
                records.insert(record.photo_id.clone(), Arc::new(Mutex::new(record)));
            }
        }
        Ok(())
    }

    async fn get(&self, photo_id: &str) -> Result<PhotoRecord, StoreError> {
        let slot = self.slot(photo_id).await?;
        let record = slot.lock().await.clone();
        Ok(record)
    }

    async fn update(&self, photo_id: &str, mutator: Mutator<'_>) -> Result<PhotoRecord, StoreError> {
        let slot = self.slot(photo_id).await?;
        let mut guard = slot.lock().await;
        let mut draft = guard.clone();
        mutator(&mut draft)?;
        *guard = draft.clone();
        Ok(draft)
    }

    async fn list(&self, owner_id: OwnerId, filter: &PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError> {
        let mut matching = Vec::new();
        for slot in self.all_slots().await {
            let record = slot.lock().await;
            if record.owner_id == owner_id && filter.matches(&record) {
                matching.push(record.clone());
            }
        }
        matching.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.photo_id.cmp(&b.photo_id))
        });
        Ok(matching)
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let mut owners = BTreeSet::new();
        for slot in self.all_slots().await {
            owners.insert(slot.lock().await.owner_id);
        }
        Ok(owners.into_iter().collect())
    }

    async fn reassign_person(
        &self,
        from: &PersonId,
        to: &PersonId,
        members: &[FaceRef],
    ) -> Result<usize, StoreError> {
        // Sorted ids give a global lock order, so concurrent rewrites cannot deadlock.
        let photo_ids: BTreeSet<&PhotoId> = members.iter().map(|m| &m.photo_id).collect();
        let mut slots = Vec::with_capacity(photo_ids.len());
        for photo_id in photo_ids {
            slots.push(self.slot(photo_id).await?);
        }

        let mut guards = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(slot.lock().await);
        }

        let mut changed = 0;
        for guard in &mut guards {
            changed += rewrite_person(guard, from, to, members);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use common_types::{BoundingBox, FaceDetection, NewPhoto, ProcessingState};

    fn record(photo_id: &str, owner_id: OwnerId) -> PhotoRecord {
        let photo = NewPhoto::builder()
            .owner_id(owner_id)
            .storage_ref(format!("originals/{photo_id}.jpg"))
            .thumbnail_ref(format!("thumbs/{photo_id}.avif"))
            .build();
        PhotoRecord::new_pending(photo_id.into(), photo, Utc::now())
    }

    fn face(person_id: Option<&str>) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            embedding: vec![1.0, 0.0],
            person_id: person_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryMetadataStore::new();
        let err = store.get("nope").await;
        assert!(matches!(err, Err(StoreError::NotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn failing_mutator_leaves_record_untouched() -> color_eyre::Result<()> {
        let store = MemoryMetadataStore::new();
        store.put(record("p1", 1)).await?;

        let result = store
            .update(
                "p1",
                Box::new(|r: &mut PhotoRecord| -> Result<(), StoreError> {
                    r.retry_count = 7;
                    r.transition(ProcessingState::Processed)?;
                    Ok(())
                }),
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition(_))));

        let stored = store.get("p1").await?;
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.state, ProcessingState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() -> color_eyre::Result<()> {
        let store = Arc::new(MemoryMetadataStore::new());
        store.put(record("p1", 1)).await?;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        "p1",
                        Box::new(|r: &mut PhotoRecord| -> Result<(), StoreError> {
                            r.retry_count += 1;
                            Ok(())
                        }),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        assert_eq!(store.get("p1").await?.retry_count, 32);
        Ok(())
    }

    #[tokio::test]
    async fn list_filters_by_owner_state_and_unassigned() -> color_eyre::Result<()> {
        let store = MemoryMetadataStore::new();
        let mut older = record("a", 1);
        older.uploaded_at = Utc::now() - Duration::hours(1);
        older.state = ProcessingState::Processed;
        older.faces = vec![face(Some("x")), face(None)];
        let mut newer = record("b", 1);
        newer.state = ProcessingState::Processed;
        newer.faces = vec![face(Some("x"))];
        store.put(newer).await?;
        store.put(older).await?;
        store.put(record("c", 1)).await?;
        store.put(record("d", 2)).await?;

        let processed = store
            .list(1, &PhotoFilter::in_state(ProcessingState::Processed))
            .await?;
        let ids: Vec<_> = processed.iter().map(|r| r.photo_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let unassigned = store
            .list(
                1,
                &PhotoFilter {
                    state: None,
                    unassigned_faces_only: true,
                },
            )
            .await?;
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].photo_id, "a");

        assert_eq!(store.owners().await?, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn reassign_rewrites_only_matching_faces() -> color_eyre::Result<()> {
        let store = MemoryMetadataStore::new();
        let mut p1 = record("p1", 1);
        p1.faces = vec![face(Some("old")), face(Some("other"))];
        let mut p2 = record("p2", 1);
        p2.faces = vec![face(Some("old"))];
        store.put(p1).await?;
        store.put(p2).await?;

        let members = [
            FaceRef::new("p1", 0),
            FaceRef::new("p1", 1),
            FaceRef::new("p2", 0),
        ];
        let changed = store
            .reassign_person(&"old".to_string(), &"new".to_string(), &members)
            .await?;
        assert_eq!(changed, 2);

        let p1 = store.get("p1").await?;
        assert_eq!(p1.faces[0].person_id.as_deref(), Some("new"));
        assert_eq!(p1.faces[1].person_id.as_deref(), Some("other"));
        assert_eq!(store.get("p2").await?.faces[0].person_id.as_deref(), Some("new"));
        Ok(())
    }

    #[tokio::test]
    async fn reassign_with_missing_record_changes_nothing() -> color_eyre::Result<()> {
        let store = MemoryMetadataStore::new();
        let mut p1 = record("p1", 1);
        p1.faces = vec![face(Some("old"))];
        store.put(p1).await?;

        let members = [FaceRef::new("p1", 0), FaceRef::new("ghost", 0)];
        let result = store
            .reassign_person(&"old".to_string(), &"new".to_string(), &members)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(store.get("p1").await?.faces[0].person_id.as_deref(), Some("old"));
        Ok(())
    }
}
