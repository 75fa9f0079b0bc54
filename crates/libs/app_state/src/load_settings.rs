use crate::{AppSettings, RawSettings};
use color_eyre::eyre::Result;
use config::{Config, Environment, File, FileFormat};
use std::path::Path;
use tracing::debug;

fn env_source() -> Environment {
    Environment::with_prefix("APP")
        .separator("__")
        .try_parsing(true)
}

/// Load settings from `config/settings.yaml`, overridden by `APP__*` env variables.
pub fn load_app_settings() -> Result<AppSettings> {
    // Need to load from dotenv to get it to overwrite the db url from env.
    dotenv::from_path(".env").ok();
    load_app_settings_from(Path::new("config/settings.yaml"))
}

pub fn load_app_settings_from(config_path: &Path) -> Result<AppSettings> {
    let config_path = config_path.canonicalize()?;
    debug!("Loading settings from {}", config_path.display());

    let raw_settings = Config::builder()
        .add_source(File::from(config_path))
        .add_source(env_source())
        .build()?
        .try_deserialize::<RawSettings>()?;

    raw_settings.try_into()
}

/// Parse settings from a YAML document, without environment overrides.
pub fn parse_settings(yaml: &str) -> Result<AppSettings> {
    let raw_settings = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()?
        .try_deserialize::<RawSettings>()?;

    raw_settings.try_into()
}

/// The settings file shipped with the repository.
pub const DEFAULT_SETTINGS_YAML: &str = include_str!("../../../../config/settings.yaml");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassifierKind, StorageBackend};
    use std::time::Duration;

    #[test]
    fn parses_default_settings() -> Result<()> {
        let settings = parse_settings(DEFAULT_SETTINGS_YAML)?;

        assert_eq!(settings.pipeline.max_retries, 5);
        assert_eq!(settings.pipeline.classifier_timeout, Duration::from_secs(10));
        assert_eq!(settings.clustering.embedding_dimension, 128);
        assert!((settings.clustering.match_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(settings.classifier.kind, ClassifierKind::Http);
        assert_eq!(settings.storage.backend, StorageBackend::Postgres);
        Ok(())
    }

    #[test]
    fn rejects_merge_threshold_above_match_threshold() {
        let yaml = DEFAULT_SETTINGS_YAML.replace("merge_threshold: 0.2", "merge_threshold: 0.5");
        assert!(parse_settings(&yaml).is_err());
    }

    #[test]
    fn rejects_lease_shorter_than_classifier_timeout() {
        let yaml = DEFAULT_SETTINGS_YAML.replace("lease_ttl_ms: 60000", "lease_ttl_ms: 5000");
        assert!(parse_settings(&yaml).is_err());
    }
}
