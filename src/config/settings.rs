/// Configuration for the synchronization engine
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Logging
    pub log_level: String,
    pub log_json: bool,

    // Source used when a query does not name one
    pub default_source: String,

    pub store: StoreConfig,
    pub staleness: StalenessConfig,
    pub fetch: FetchConfig,
    pub sync: SyncConfig,
    pub aggregation: AggregationConfig,
    pub sources: Vec<SourceConfig>,
    pub prefetch: PrefetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            log_json: false,
            default_source: "default".to_string(),
            store: StoreConfig::default(),
            staleness: StalenessConfig::default(),
            fetch: FetchConfig::default(),
            sync: SyncConfig::default(),
            aggregation: AggregationConfig::default(),
            sources: Vec::new(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl Config {
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Where durable state lives. `None` keeps that piece in memory only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub points_path: Option<String>,
    pub sources_path: Option<String>,
    pub quality_log_path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            points_path: Some("data/points.jsonl".to_string()),
            sources_path: Some("data/sources.json".to_string()),
            quality_log_path: Some("data/quality.jsonl".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessMode {
    Fixed,
    MarketSession,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub mode: StalenessMode,
    pub threshold_minutes: i64,

    // Market session calendar (mode = "market_session")
    pub timezone: String,
    pub session_open: String,
    pub session_close: String,
    pub holidays: Vec<String>,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        StalenessConfig {
            mode: StalenessMode::Fixed,
            threshold_minutes: 60,
            timezone: "UTC".to_string(),
            session_open: "09:00".to_string(),
            session_close: "17:00".to_string(),
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_sec: u64,
    pub requests_per_second: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_sec: 30,
            requests_per_second: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    // Deadline for one coalesced fetch-and-merge cycle
    pub deadline_sec: u64,
    // Extra time a follower waits beyond the deadline
    pub follower_grace_sec: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            deadline_sec: 60,
            follower_grace_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub sweep_interval_sec: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            sweep_interval_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Csv,
    External,
}

/// Provisioning entry for one named source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_connector_kind")]
    pub kind: ConnectorKind,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn default_connector_kind() -> ConnectorKind {
    ConnectorKind::External
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub tickers: Vec<String>,
    pub days: i64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            tickers: Vec::new(),
            days: 90,
        }
    }
}
