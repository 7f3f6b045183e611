/// Configuration loading: TOML file layered with environment overrides
use std::path::Path;

use config::{Environment, File, FileFormat};

use super::settings::{Config, ConnectorKind, StalenessMode};
use crate::error::{Result, SyncError};

/// Environment prefix, e.g. `SERIESYNC_SYNC__DEADLINE_SEC=30`
pub const ENV_PREFIX: &str = "SERIESYNC";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(File::from(path.as_ref()).format(FileFormat::Toml).required(true))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = settings.try_deserialize()?;

    validate_config(&config)?;

    Ok(config)
}

/// Parse a TOML document without touching the environment
pub fn load_config_from_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.default_source.trim().is_empty() {
        return Err(SyncError::Config("default_source is empty".to_string()));
    }

    if config.staleness.threshold_minutes < 0 {
        return Err(SyncError::Config(format!(
            "Invalid staleness.threshold_minutes: {}",
            config.staleness.threshold_minutes
        )));
    }

    if config.staleness.mode == StalenessMode::MarketSession
        && config.staleness.timezone.parse::<chrono_tz::Tz>().is_err()
    {
        return Err(SyncError::Config(format!(
            "Unknown staleness.timezone: {}",
            config.staleness.timezone
        )));
    }

    if config.fetch.timeout_sec == 0 || config.sync.deadline_sec == 0 {
        return Err(SyncError::Config("fetch.timeout_sec and sync.deadline_sec must be > 0".to_string()));
    }

    if config.fetch.requests_per_second == 0 {
        return Err(SyncError::Config("fetch.requests_per_second must be > 0".to_string()));
    }

    if config.aggregation.sweep_interval_sec == 0 {
        return Err(SyncError::Config("aggregation.sweep_interval_sec must be > 0".to_string()));
    }

    if config.prefetch.days <= 0 {
        return Err(SyncError::Config(format!("Invalid prefetch.days: {}", config.prefetch.days)));
    }

    let mut seen = std::collections::HashSet::new();
    for source in &config.sources {
        if source.name.trim().is_empty() {
            return Err(SyncError::Config("source with empty name".to_string()));
        }
        if !seen.insert(source.name.as_str()) {
            return Err(SyncError::Config(format!("Duplicate source: {}", source.name)));
        }
        if source.kind == ConnectorKind::Csv && source.dir.is_none() {
            return Err(SyncError::Config(format!("CSV source '{}' needs a dir", source.name)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
default_source = "curveseries"

[staleness]
mode = "market_session"
threshold_minutes = 30
timezone = "America/New_York"
session_open = "09:30"
session_close = "16:00"
holidays = ["2025-12-25"]

[sync]
deadline_sec = 20

[[sources]]
name = "curveseries"
kind = "csv"
dir = "data/upstream/curveseries"

[[sources]]
name = "kpler"
enabled = false
"#;

    #[test]
    fn test_load_from_str() {
        let config = load_config_from_str(SAMPLE).unwrap();

        assert_eq!(config.default_source, "curveseries");
        assert_eq!(config.staleness.mode, StalenessMode::MarketSession);
        assert_eq!(config.sync.deadline_sec, 20);
        // untouched sections keep their defaults
        assert_eq!(config.fetch.timeout_sec, 30);
        assert_eq!(config.sources.len(), 2);
        assert!(!config.source("kpler").unwrap().enabled);
        assert_eq!(config.source("kpler").unwrap().kind, ConnectorKind::External);
    }

    #[test]
    fn test_rejects_duplicate_sources() {
        let content = r#"
[[sources]]
name = "a"
[[sources]]
name = "a"
"#;
        assert!(load_config_from_str(content).is_err());
    }

    #[test]
    fn test_rejects_csv_without_dir() {
        let content = r#"
[[sources]]
name = "a"
kind = "csv"
"#;
        assert!(load_config_from_str(content).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.staleness.threshold_minutes, 30);
    }
}
