/// Offline connector reading `<dir>/<ticker>.csv` files
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::{FetchError, UpstreamFetcher};
use crate::types::{DataPoint, TimeRange};

/// Rows are `timestamp,value[,unit]` with an optional header line
pub struct CsvDirectoryFetcher {
    source: String,
    dir: PathBuf,
}

impl CsvDirectoryFetcher {
    pub fn new(source: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        CsvDirectoryFetcher {
            source: source.into(),
            dir: dir.into(),
        }
    }

    fn parse_row(&self, ticker: &str, record: &csv::StringRecord, line: u64) -> Result<DataPoint, String> {
        let ts_raw = record.get(0).map(str::trim).unwrap_or_default();
        let value_raw = record.get(1).map(str::trim).unwrap_or_default();

        let timestamp = parse_timestamp(ts_raw).ok_or_else(|| format!("line {}: bad timestamp '{}'", line, ts_raw))?;
        let value: f64 = value_raw
            .parse()
            .map_err(|_| format!("line {}: bad value '{}'", line, value_raw))?;

        let mut point = DataPoint::new(self.source.clone(), ticker, timestamp, value)
            .with_metadata("line", json!(line))
            .with_raw_payload(json!(record.iter().collect::<Vec<_>>()));

        if let Some(unit) = record.get(2).map(str::trim).filter(|u| !u.is_empty()) {
            point = point.with_unit(unit);
        }
        Ok(point)
    }
}

/// RFC3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date at midnight UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

fn is_header(record: &csv::StringRecord) -> bool {
    record
        .get(0)
        .map(|first| first.trim().eq_ignore_ascii_case("timestamp"))
        .unwrap_or(false)
}

#[async_trait]
impl UpstreamFetcher for CsvDirectoryFetcher {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, ticker: &str, range: TimeRange) -> Result<Vec<DataPoint>, FetchError> {
        if ticker.is_empty() || ticker.contains(['/', '\\']) || ticker == ".." {
            return Err(FetchError::InvalidTicker(ticker.to_string()));
        }
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(FetchError::Unavailable(format!("directory {} not found", self.dir.display())));
        }

        let path = self.dir.join(format!("{}.csv", ticker));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::InvalidTicker(ticker.to_string()));
            }
            Err(e) => return Err(FetchError::Unavailable(e.to_string())),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes.as_slice());

        let mut points = Vec::new();
        let mut parsed = 0usize;

        for (idx, row) in reader.records().enumerate() {
            let line = idx as u64 + 1;
            let outcome = row
                .map_err(|e| format!("line {}: {}", line, e))
                .and_then(|record| {
                    if line == 1 && is_header(&record) {
                        Ok(None)
                    } else {
                        self.parse_row(ticker, &record, line).map(Some)
                    }
                });

            match outcome {
                Ok(Some(point)) => {
                    parsed += 1;
                    if range.contains(point.timestamp) {
                        points.push(point);
                    }
                }
                Ok(None) => {}
                Err(cause) => {
                    warn!("{} stopped reading {}: {}", self.source, path.display(), cause);
                    return if parsed > 0 {
                        Err(FetchError::PartialData { points, cause })
                    } else {
                        Err(FetchError::Unavailable(cause))
                    };
                }
            }
        }

        debug!("{}: {} of {} rows for {} fall in {}", self.source, points.len(), parsed, ticker, range);
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn write(dir: &TempDir, ticker: &str, body: &str) {
        std::fs::write(dir.path().join(format!("{}.csv", ticker)), body).unwrap();
    }

    fn march() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reads_rows_inside_range() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "BRENT",
            "timestamp,value,unit\n2025-02-27,70.1,USD/bbl\n2025-03-03 16:00:00,71.2,USD/bbl\n2025-03-04T16:00:00Z,72.4,\n",
        );

        let fetcher = CsvDirectoryFetcher::new("csv", dir.path());
        let points = fetcher.fetch("BRENT", march()).await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 71.2);
        assert_eq!(points[0].unit.as_deref(), Some("USD/bbl"));
        assert_eq!(points[1].unit, None);
        assert_eq!(points[0].source, "csv");
        assert_eq!(points[0].metadata.get("line"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_malformed_row_yields_partial_data() {
        let dir = TempDir::new().unwrap();
        write(&dir, "WTI", "2025-03-03,68.0\n2025-03-04,oops\n2025-03-05,69.0\n");

        let fetcher = CsvDirectoryFetcher::new("csv", dir.path());
        match fetcher.fetch("WTI", march()).await {
            Err(FetchError::PartialData { points, cause }) => {
                assert_eq!(points.len(), 1);
                assert!(cause.contains("line 2"));
            }
            other => panic!("expected partial data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_first_row_is_unavailable() {
        let dir = TempDir::new().unwrap();
        write(&dir, "WTI", "not-a-date,1.0\n");

        let fetcher = CsvDirectoryFetcher::new("csv", dir.path());
        assert!(matches!(fetcher.fetch("WTI", march()).await, Err(FetchError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unknown_ticker_and_missing_dir() {
        let dir = TempDir::new().unwrap();
        let fetcher = CsvDirectoryFetcher::new("csv", dir.path());
        assert!(matches!(fetcher.fetch("NOPE", march()).await, Err(FetchError::InvalidTicker(_))));
        assert!(matches!(fetcher.fetch("../etc", march()).await, Err(FetchError::InvalidTicker(_))));

        let gone = CsvDirectoryFetcher::new("csv", dir.path().join("missing"));
        assert!(matches!(gone.fetch("WTI", march()).await, Err(FetchError::Unavailable(_))));
    }
}
