use app_state::{load_app_settings, AppSettings};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use common_services::backend::{classifier_from_settings, Backends};
use common_services::clustering::FaceClusterEngine;
use common_services::search::{DateRange, InMemorySearchIndex, IndexSync, SearchFilters, SearchQuery};
use common_services::upload::{requeue_failed, submit_upload};
use common_types::{GeoPoint, NewPhoto, OwnerId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use worker::context::WorkerContext;
use worker::demo::run_demo;
use worker::worker::run_pipeline;

#[derive(Parser, Debug)]
#[command(version, about = "Photo ingestion workers and face clustering", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process queued photos until Ctrl-C.
    Run,
    /// Register an uploaded photo and queue it for analysis.
    Upload {
        #[arg(long)]
        owner: OwnerId,
        #[arg(long)]
        storage_ref: String,
        #[arg(long)]
        thumbnail_ref: Option<String>,
        #[arg(long)]
        taken_at: Option<DateTime<Utc>>,
        #[arg(long, requires = "longitude", allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[arg(long, requires = "latitude", allow_hyphen_values = true)]
        longitude: Option<f64>,
    },
    /// Search an owner's processed photos.
    Search {
        #[arg(long)]
        owner: OwnerId,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
        text: Vec<String>,
    },
    /// Run one face cluster merge pass.
    Merge,
    /// Queue every failed photo of an owner again with a fresh retry budget.
    Retry {
        #[arg(long)]
        owner: OwnerId,
    },
    /// Run the whole pipeline in memory on sample photos.
    Demo,
}

fn init_logging(settings: &AppSettings) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let settings = load_app_settings()?;
    init_logging(&settings);

    match args.command {
        Command::Run => run(settings).await,
        Command::Upload {
            owner,
            storage_ref,
            thumbnail_ref,
            taken_at,
            latitude,
            longitude,
        } => {
            let backends = Backends::connect(&settings).await?;
            let location = latitude
                .zip(longitude)
                .map(|(latitude, longitude)| GeoPoint { latitude, longitude });
            let photo = NewPhoto::builder()
                .owner_id(owner)
                .thumbnail_ref(thumbnail_ref.unwrap_or_else(|| format!("thumbs/{storage_ref}")))
                .storage_ref(storage_ref)
                .maybe_taken_at(taken_at)
                .maybe_location(location)
                .build();
            let record = submit_upload(backends.metadata.as_ref(), backends.queue.as_ref(), photo).await?;
            println!("{}", record.photo_id);
            Ok(())
        }
        Command::Search {
            owner,
            from,
            to,
            limit,
            text,
        } => {
            let backends = Backends::connect(&settings).await?;
            let sync = IndexSync::new(Arc::new(InMemorySearchIndex::new()), backends.metadata.clone());
            sync.rebuild().await?;
            let date_range = (from.is_some() || to.is_some()).then_some(DateRange { start: from, end: to });
            let query = SearchQuery::builder()
                .text(text.join(" "))
                .filters(SearchFilters {
                    date_range,
                    region: None,
                })
                .maybe_limit(limit)
                .build();
            for photo_id in sync.index().query(owner, &query).await? {
                println!("{photo_id}");
            }
            Ok(())
        }
        Command::Merge => {
            let backends = Backends::connect(&settings).await?;
            let engine = FaceClusterEngine::load(backends.clusters, backends.metadata, settings.clustering).await?;
            let report = engine.run_merge_pass().await?;
            println!(
                "merged {}, deferred {}, faces reassigned {}",
                report.merged, report.deferred, report.reassigned_faces
            );
            Ok(())
        }
        Command::Retry { owner } => {
            let backends = Backends::connect(&settings).await?;
            let queued = requeue_failed(backends.metadata.as_ref(), backends.queue.as_ref(), owner).await?;
            println!("requeued {queued} photos");
            Ok(())
        }
        Command::Demo => {
            let summary = run_demo(settings).await?;
            for photo in &summary.photos {
                let labels: Vec<&str> = photo.labels.iter().map(|l| l.name.as_str()).collect();
                println!(
                    "{} {:?} [{}] faces: {:?}",
                    photo.photo_id,
                    photo.state,
                    labels.join(", "),
                    photo.faces.iter().map(|f| f.person_id.as_deref()).collect::<Vec<_>>()
                );
            }
            for (text, hits) in &summary.searches {
                println!("search {text:?}: {hits:?}");
            }
            for person in &summary.people {
                println!("person {} with {} faces", person.person_id, person.member_count);
            }
            Ok(())
        }
    }
}

async fn run(settings: AppSettings) -> Result<()> {
    let backends = Backends::connect(&settings).await?;
    let classifier = classifier_from_settings(&settings)?;
    let context = Arc::new(WorkerContext::new(settings, backends, classifier).await?);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {err}");
            return;
        }
        info!("Ctrl-C received, finishing in-flight photos.");
        on_signal.cancel();
    });

    run_pipeline(context, shutdown).await
}
