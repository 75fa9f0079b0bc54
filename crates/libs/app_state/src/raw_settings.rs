use serde::Deserialize;

/// Settings as they appear in `config/settings.yaml`, before durations are
/// materialized and thresholds are checked.
#[derive(Debug, Deserialize, Clone)]
pub struct RawSettings {
    pub pipeline: RawPipelineSettings,
    pub clustering: ClusteringSettings,
    pub classifier: ClassifierSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub secrets: SecretSettings,
}

/// Worker pool, retry and lease timings. All durations in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct RawPipelineSettings {
    pub workers: usize,
    pub max_retries: i32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub classifier_timeout_ms: u64,
    pub lease_ttl_ms: u64,
    pub lease_heartbeat_ms: u64,
    pub lease_conflict_delay_ms: u64,
    pub visibility_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reindex_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClusteringSettings {
    /// Length of every face embedding.
    pub embedding_dimension: usize,
    /// Cosine distance below which a face joins its nearest person.
    pub match_threshold: f32,
    /// Cosine distance below which two people are merged.
    pub merge_threshold: f32,
    pub merge_interval_secs: u64,
    /// Past this many people per owner the exact centroid scan logs a warning.
    pub max_exact_scan_clusters: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Http,
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierSettings {
    pub kind: ClassifierKind,
    pub base_url: String,
    pub simulated_latency_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub database: DatabaseSettings,
}

/// Database connection pool configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub max_connections: u32,
    pub min_connection: u32,
    pub max_lifetime: u64,
    pub idle_timeout: u64,
    pub acquire_timeout: u64,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretSettings {
    pub database_url: String,
}
