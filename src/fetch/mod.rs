/// Upstream fetcher abstraction.
///
/// Concrete connectors implement `UpstreamFetcher`; the orchestrator only
/// talks to them through `FetcherRegistry`, usually wrapped in a
/// `GuardedFetcher` for rate limiting and a per-call deadline.
pub mod csv_dir;
pub mod guarded;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DataPoint, TimeRange};

pub use csv_dir::CsvDirectoryFetcher;
pub use guarded::GuardedFetcher;

/// Failure modes of an upstream fetch. Cloneable so a single outcome can be
/// handed to every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid ticker: {0}")]
    InvalidTicker(String),

    /// Points obtained before the interruption are usable
    #[error("Partial data ({} points): {cause}", .points.len())]
    PartialData { points: Vec<DataPoint>, cause: String },

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Check if a later retry of the same fetch may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidTicker(_))
    }

    pub fn error_code(&self) -> &str {
        match self {
            FetchError::Unavailable(_) => "FETCH_001",
            FetchError::InvalidTicker(_) => "FETCH_002",
            FetchError::PartialData { .. } => "FETCH_003",
            FetchError::Timeout(_) => "FETCH_004",
        }
    }
}

/// A source of raw points for tickers over a time range
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Name of the source this connector produces points for
    fn source(&self) -> &str;

    /// Fetch points for `ticker` inside `range`, ascending by timestamp
    async fn fetch(&self, ticker: &str, range: TimeRange) -> Result<Vec<DataPoint>, FetchError>;
}

/// Connectors by source name
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn UpstreamFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its own source name, replacing any previous one
    pub fn register(&mut self, fetcher: Arc<dyn UpstreamFetcher>) {
        self.fetchers.insert(fetcher.source().to_string(), fetcher);
    }

    pub fn with(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn UpstreamFetcher>> {
        self.fetchers.get(source).cloned()
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fetchers.keys().cloned().collect();
        names.sort();
        names
    }
}
