use crate::context::WorkerContext;
use crate::worker::run_pipeline;
use app_state::AppSettings;
use color_eyre::Result;
use common_services::backend::Backends;
use common_services::classifier::SimulatedClassifier;
use common_services::search::SearchQuery;
use common_services::upload::submit_upload;
use common_types::{NewPhoto, OwnerId, PersonCluster, PhotoId, PhotoRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DEMO_OWNER: OwnerId = 1;

/// Storage references understood by the simulated classifier.
pub const SAMPLE_PHOTOS: &[&str] = &[
    "originals/1/dog_beach_face-alice.jpg",
    "originals/1/login_face-alice_face-bob.png",
    "originals/1/screenshot_error_text-timeout.png",
    "originals/1/job_face-bob.jpg",
];

pub const SAMPLE_SEARCHES: &[&str] = &["dog", "error", "time", "person"];

#[derive(Debug)]
pub struct DemoSummary {
    pub photos: Vec<PhotoRecord>,
    pub searches: Vec<(String, Vec<PhotoId>)>,
    pub people: Vec<PersonCluster>,
}

/// Uploads the sample photos into in-memory backends, runs the pipeline with
/// the simulated classifier until the queue drains, then searches and lists
/// the people found.
pub async fn run_demo(settings: AppSettings) -> Result<DemoSummary> {
    let backends = Backends::in_memory(settings.pipeline.visibility_timeout);
    let classifier = Arc::new(SimulatedClassifier::new(
        settings.clustering.embedding_dimension,
        Duration::from_millis(settings.classifier.simulated_latency_ms),
    ));
    let context = Arc::new(WorkerContext::new(settings, backends, classifier).await?);

    let mut photo_ids = Vec::with_capacity(SAMPLE_PHOTOS.len());
    for storage_ref in SAMPLE_PHOTOS {
        let photo = NewPhoto::builder()
            .owner_id(DEMO_OWNER)
            .storage_ref(*storage_ref)
            .thumbnail_ref(storage_ref.replacen("originals/", "thumbs/", 1))
            .build();
        let record = submit_upload(context.metadata.as_ref(), context.queue.as_ref(), photo).await?;
        photo_ids.push(record.photo_id);
    }

    let shutdown = CancellationToken::new();
    let pipeline = tokio::spawn(run_pipeline(context.clone(), shutdown.clone()));
    while context.queue.outstanding().await? > 0 {
        sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    pipeline.await??;

    let report = context.engine.run_merge_pass().await?;
    info!("Demo merge pass: {} clusters merged", report.merged);

    let mut photos = Vec::with_capacity(photo_ids.len());
    for photo_id in &photo_ids {
        photos.push(context.metadata.get(photo_id).await?);
    }
    let mut searches = Vec::with_capacity(SAMPLE_SEARCHES.len());
    for text in SAMPLE_SEARCHES {
        let hits = context
            .index
            .index()
            .query(DEMO_OWNER, &SearchQuery::builder().text(*text).build())
            .await?;
        searches.push(((*text).to_string(), hits));
    }

    Ok(DemoSummary {
        photos,
        searches,
        people: context.engine.people(DEMO_OWNER).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_state::{parse_settings, DEFAULT_SETTINGS_YAML};
    use common_types::ProcessingState;

    #[tokio::test]
    async fn demo_processes_searches_and_clusters() -> Result<()> {
        let mut settings = parse_settings(DEFAULT_SETTINGS_YAML)?;
        settings.classifier.simulated_latency_ms = 0;
        settings.pipeline.workers = 2;

        let summary = run_demo(settings).await?;

        assert!(summary.photos.iter().all(|p| p.state == ProcessingState::Processed));
        let hits = |text: &str| {
            summary
                .searches
                .iter()
                .find(|(query, _)| query == text)
                .map(|(_, hits)| hits.clone())
                .unwrap_or_default()
        };
        assert_eq!(hits("dog"), [summary.photos[0].photo_id.clone()]);
        assert_eq!(hits("error"), [summary.photos[2].photo_id.clone()]);
        assert_eq!(hits("time"), [summary.photos[2].photo_id.clone()]);
        assert_eq!(hits("person").len(), SAMPLE_PHOTOS.len());

        // alice appears in photos 0 and 1, bob in photos 1 and 3.
        assert_eq!(summary.people.len(), 2);
        assert!(summary.people.iter().all(|p| p.member_count == 2));
        let alice = summary.photos[0].faces[0].person_id.clone();
        assert!(alice.is_some());
        assert_eq!(summary.photos[1].faces[0].person_id, alice);
        assert_eq!(summary.photos[3].faces[0].person_id, summary.photos[1].faces[1].person_id);
        assert_ne!(summary.photos[3].faces[0].person_id, alice);
        Ok(())
    }
}
