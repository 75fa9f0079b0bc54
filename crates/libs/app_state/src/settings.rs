use crate::{
    ClassifierSettings, ClusteringSettings, LoggingSettings, RawPipelineSettings, RawSettings,
    SecretSettings, StorageSettings,
};
use color_eyre::eyre::{Report, ensure};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub pipeline: PipelineSettings,
    pub clustering: ClusteringSettings,
    pub classifier: ClassifierSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub secrets: SecretSettings,
}

/// Pipeline timings with durations materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub max_retries: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub classifier_timeout: Duration,
    pub lease_ttl: Duration,
    pub lease_heartbeat: Duration,
    pub lease_conflict_delay: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub reindex_interval: Duration,
}

impl TryFrom<RawPipelineSettings> for PipelineSettings {
    type Error = Report;

    fn try_from(raw: RawPipelineSettings) -> Result<Self, Self::Error> {
        ensure!(raw.workers > 0, "pipeline.workers must be at least 1");
        ensure!(raw.max_retries >= 0, "pipeline.max_retries cannot be negative");
        ensure!(
            raw.lease_ttl_ms > raw.classifier_timeout_ms,
            "pipeline.lease_ttl_ms ({}) must exceed pipeline.classifier_timeout_ms ({})",
            raw.lease_ttl_ms,
            raw.classifier_timeout_ms
        );
        ensure!(
            raw.lease_heartbeat_ms < raw.lease_ttl_ms,
            "pipeline.lease_heartbeat_ms must be shorter than pipeline.lease_ttl_ms"
        );
        ensure!(
            raw.lease_heartbeat_ms > 0 && raw.poll_interval_ms > 0 && raw.reindex_interval_ms > 0,
            "pipeline heartbeat, poll and reindex intervals must be positive"
        );

        Ok(Self {
            workers: raw.workers,
            max_retries: raw.max_retries,
            backoff_base: Duration::from_millis(raw.backoff_base_ms),
            backoff_cap: Duration::from_millis(raw.backoff_cap_ms),
            classifier_timeout: Duration::from_millis(raw.classifier_timeout_ms),
            lease_ttl: Duration::from_millis(raw.lease_ttl_ms),
            lease_heartbeat: Duration::from_millis(raw.lease_heartbeat_ms),
            lease_conflict_delay: Duration::from_millis(raw.lease_conflict_delay_ms),
            visibility_timeout: Duration::from_millis(raw.visibility_timeout_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            reindex_interval: Duration::from_millis(raw.reindex_interval_ms),
        })
    }
}

impl ClusteringSettings {
    #[must_use]
    pub const fn merge_interval(&self) -> Duration {
        Duration::from_secs(self.merge_interval_secs)
    }

    fn check(&self) -> color_eyre::Result<()> {
        ensure!(
            self.embedding_dimension > 0,
            "clustering.embedding_dimension must be positive"
        );
        ensure!(
            self.merge_interval_secs > 0,
            "clustering.merge_interval_secs must be positive"
        );
        ensure!(
            self.match_threshold > 0.0 && self.match_threshold <= 2.0,
            "clustering.match_threshold must be within (0, 2]"
        );
        ensure!(
            self.merge_threshold > 0.0 && self.merge_threshold < self.match_threshold,
            "clustering.merge_threshold ({}) must be positive and below match_threshold ({})",
            self.merge_threshold,
            self.match_threshold
        );
        Ok(())
    }
}

impl TryFrom<RawSettings> for AppSettings {
    type Error = Report;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        raw.clustering.check()?;

        Ok(Self {
            pipeline: raw.pipeline.try_into()?,
            clustering: raw.clustering,
            classifier: raw.classifier,
            storage: raw.storage,
            logging: raw.logging,
            secrets: raw.secrets,
        })
    }
}
