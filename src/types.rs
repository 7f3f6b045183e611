/// Core type definitions for the synchronization engine
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Open, non-identifying annotations attached to a point
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata keys that would shadow the identity of a point
pub const RESERVED_METADATA_KEYS: &[&str] = &["source", "ticker", "timestamp"];

/// Identity of one series: (source, ticker)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub source: String,
    pub ticker: String,
}

impl SeriesKey {
    pub fn new(source: impl Into<String>, ticker: impl Into<String>) -> Self {
        SeriesKey {
            source: source.into(),
            ticker: ticker.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.ticker)
    }
}

/// A single measurement of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub source: String,
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub raw_payload: Option<serde_json::Value>,
}

impl DataPoint {
    pub fn new(
        source: impl Into<String>,
        ticker: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        DataPoint {
            source: source.into(),
            ticker: ticker.into(),
            timestamp,
            value,
            unit: None,
            metadata: Metadata::new(),
            raw_payload: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_raw_payload(mut self, raw: serde_json::Value) -> Self {
        self.raw_payload = Some(raw);
        self
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.source.clone(), self.ticker.clone())
    }
}

/// Closed time interval [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    /// The newest `days` days ending at `now`; `None` when the start would
    /// fall outside the representable time line
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Option<Self> {
        let span = Duration::try_days(days)?;
        let start = now.checked_sub_signed(span)?;
        Some(TimeRange { start, end: now })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Per-source bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SourceState {
    pub fn new(name: impl Into<String>) -> Self {
        SourceState {
            name: name.into(),
            enabled: true,
            config: serde_json::Value::Null,
            last_sync: None,
            last_attempt: None,
            last_error: None,
        }
    }
}

/// Bucket width for OHLC rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketWidth {
    Hour,
    Day,
}

impl BucketWidth {
    pub fn as_str(&self) -> &str {
        match self {
            BucketWidth::Hour => "1h",
            BucketWidth::Day => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            BucketWidth::Hour => Duration::hours(1),
            BucketWidth::Day => Duration::days(1),
        }
    }

    pub fn all() -> [BucketWidth; 2] {
        [BucketWidth::Hour, BucketWidth::Day]
    }
}

/// Derived OHLC row for one bucket interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBucket {
    pub source: String,
    pub ticker: String,
    pub width: BucketWidth,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub avg_value: f64,
    pub count: usize,
}

/// Kind of data quality issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityIssue {
    MissingData,
    InvalidValue,
    DuplicateConflict,
}

impl QualityIssue {
    pub fn as_str(&self) -> &str {
        match self {
            QualityIssue::MissingData => "missing-data",
            QualityIssue::InvalidValue => "invalid-value",
            QualityIssue::DuplicateConflict => "duplicate-conflict",
        }
    }
}

/// Append-only quality log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvent {
    pub id: String,
    pub source: String,
    pub ticker: String,
    pub kind: QualityIssue,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}
