/// Hybrid point storage - ordered in-memory index + JSONL append log (disk)
///
/// Every upsert is written to the log before the index is touched, so a
/// restart replays the log and converges on the same state (last line for an
/// identity wins, ids are preserved).
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{DataPoint, SeriesKey};

/// How an upsert changed the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub id: u64,
    pub kind: UpsertKind,
    /// Stored value before this write, if the identity already existed
    pub previous_value: Option<f64>,
}

/// Re-ingest of an existing identity with a different value
#[derive(Debug, Clone, PartialEq)]
pub struct ValueConflict {
    pub source: String,
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub previous: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkUpsertReport {
    pub count: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: Vec<ValueConflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    id: u64,
    #[serde(flatten)]
    point: DataPoint,
}

#[derive(Debug, Clone)]
struct StoredPoint {
    id: u64,
    point: DataPoint,
}

impl StoredPoint {
    fn same_payload(&self, other: &DataPoint) -> bool {
        self.point.value.to_bits() == other.value.to_bits()
            && self.point.unit == other.unit
            && self.point.metadata == other.metadata
            && self.point.raw_payload == other.raw_payload
    }
}

/// Point store keyed by (source, ticker, timestamp)
pub struct HybridPointStore {
    series: HashMap<SeriesKey, BTreeMap<DateTime<Utc>, StoredPoint>>,
    next_id: u64,
    log_path: Option<PathBuf>,
}

impl HybridPointStore {
    /// Store without a disk log
    pub fn in_memory() -> Self {
        HybridPointStore {
            series: HashMap::new(),
            next_id: 1,
            log_path: None,
        }
    }

    /// Open (or create) a store backed by the JSONL log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = HybridPointStore {
            series: HashMap::new(),
            next_id: 1,
            log_path: Some(path.into()),
        };
        store.replay().await?;
        Ok(store)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Insert or overwrite one point (last-write-wins)
    pub async fn upsert(&mut self, point: DataPoint) -> Result<UpsertOutcome> {
        let (outcome, record) = self.classify(&point);

        if let Some(record) = record {
            self.append_to_disk(std::slice::from_ref(&record)).await?;
            self.apply(record);
        }

        Ok(outcome)
    }

    /// Upsert every point; safe to re-run with the same input
    pub async fn bulk_upsert(&mut self, points: Vec<DataPoint>) -> Result<BulkUpsertReport> {
        let mut report = BulkUpsertReport {
            count: points.len(),
            ..Default::default()
        };

        // Collapse duplicates inside the batch, the last occurrence wins
        let mut batch: BTreeMap<(SeriesKey, DateTime<Utc>), DataPoint> = BTreeMap::new();
        for point in points {
            let slot = (point.key(), point.timestamp);
            if let Some(earlier) = batch.get(&slot) {
                if earlier.value.to_bits() != point.value.to_bits() {
                    report.conflicts.push(ValueConflict {
                        source: point.source.clone(),
                        ticker: point.ticker.clone(),
                        timestamp: point.timestamp,
                        previous: earlier.value,
                        current: point.value,
                    });
                }
            }
            batch.insert(slot, point);
        }

        let mut records = Vec::with_capacity(batch.len());
        for point in batch.into_values() {
            let (outcome, record) = self.classify(&point);
            match outcome.kind {
                UpsertKind::Inserted => report.inserted += 1,
                UpsertKind::Updated => report.updated += 1,
                UpsertKind::Unchanged => report.unchanged += 1,
            }
            if let Some(previous) = outcome.previous_value {
                if previous.to_bits() != point.value.to_bits() {
                    report.conflicts.push(ValueConflict {
                        source: point.source.clone(),
                        ticker: point.ticker.clone(),
                        timestamp: point.timestamp,
                        previous,
                        current: point.value,
                    });
                }
            }
            if let Some(record) = record {
                // ids for new identities must stay unique within the batch
                if outcome.kind == UpsertKind::Inserted {
                    self.next_id += 1;
                }
                records.push(record);
            }
        }

        self.append_to_disk(&records).await?;
        for record in records {
            self.apply(record);
        }

        debug!(
            "Bulk upsert: {} points ({} inserted, {} updated, {} unchanged, {} conflicts)",
            report.count,
            report.inserted,
            report.updated,
            report.unchanged,
            report.conflicts.len()
        );

        Ok(report)
    }

    /// Points for `ticker` with `from <= timestamp <= to`, ascending.
    /// `source = None` merges every source (ties ordered by source).
    pub fn range_scan(
        &self,
        source: Option<&str>,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<DataPoint> {
        if from > to {
            return Vec::new();
        }

        let mut points: Vec<DataPoint> = self
            .matching_series(source, ticker)
            .flat_map(|series| series.range(from..=to).map(|(_, stored)| stored.point.clone()))
            .collect();

        if source.is_none() {
            points.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.source.cmp(&b.source))
            });
        }

        points
    }

    /// Most recent point for `ticker`, if any
    pub fn latest(&self, ticker: &str, source: Option<&str>) -> Option<DataPoint> {
        self.matching_series(source, ticker)
            .filter_map(|series| series.values().next_back())
            .max_by(|a, b| {
                a.point
                    .timestamp
                    .cmp(&b.point.timestamp)
                    .then_with(|| b.point.source.cmp(&a.point.source))
            })
            .map(|stored| stored.point.clone())
    }

    /// Oldest and newest stored timestamps
    pub fn coverage(&self, source: Option<&str>, ticker: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.matching_series(source, ticker)
            .filter_map(|series| {
                let first = series.keys().next()?;
                let last = series.keys().next_back()?;
                Some((*first, *last))
            })
            .reduce(|(a_first, a_last), (b_first, b_last)| (a_first.min(b_first), a_last.max(b_last)))
    }

    /// Distinct tickers, sorted
    pub fn tickers(&self, source: Option<&str>) -> Vec<String> {
        let mut tickers: Vec<String> = self
            .series
            .iter()
            .filter(|(key, series)| !series.is_empty() && source.map_or(true, |s| key.source == s))
            .map(|(key, _)| key.ticker.clone())
            .collect();
        tickers.sort();
        tickers.dedup();
        tickers
    }

    /// Stored id of an identity
    pub fn id_of(&self, source: &str, ticker: &str, timestamp: DateTime<Utc>) -> Option<u64> {
        self.series
            .get(&SeriesKey::new(source, ticker))?
            .get(&timestamp)
            .map(|stored| stored.id)
    }

    /// Total number of stored points
    pub fn len(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log with one line per live identity
    pub async fn compact(&mut self) -> Result<()> {
        let Some(path) = self.log_path.clone() else {
            return Ok(());
        };

        let tmp_path = path.with_extension("jsonl.compact");
        let mut body = String::new();
        for series in self.series.values() {
            for stored in series.values() {
                let record = LogRecord {
                    id: stored.id,
                    point: stored.point.clone(),
                };
                body.push_str(&serde_json::to_string(&record)?);
                body.push('\n');
            }
        }

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        info!("Compacted point log {} ({} points)", path.display(), self.len());
        Ok(())
    }

    fn matching_series<'a>(
        &'a self,
        source: Option<&'a str>,
        ticker: &'a str,
    ) -> impl Iterator<Item = &'a BTreeMap<DateTime<Utc>, StoredPoint>> + 'a {
        self.series
            .iter()
            .filter(move |(key, _)| key.ticker == ticker && source.map_or(true, |s| key.source == s))
            .map(|(_, series)| series)
    }

    /// Decide what an upsert of `point` would do, without mutating
    fn classify(&self, point: &DataPoint) -> (UpsertOutcome, Option<LogRecord>) {
        let existing = self
            .series
            .get(&point.key())
            .and_then(|series| series.get(&point.timestamp));

        match existing {
            Some(stored) if stored.same_payload(point) => (
                UpsertOutcome {
                    id: stored.id,
                    kind: UpsertKind::Unchanged,
                    previous_value: Some(stored.point.value),
                },
                None,
            ),
            Some(stored) => (
                UpsertOutcome {
                    id: stored.id,
                    kind: UpsertKind::Updated,
                    previous_value: Some(stored.point.value),
                },
                Some(LogRecord {
                    id: stored.id,
                    point: point.clone(),
                }),
            ),
            None => (
                UpsertOutcome {
                    id: self.next_id,
                    kind: UpsertKind::Inserted,
                    previous_value: None,
                },
                Some(LogRecord {
                    id: self.next_id,
                    point: point.clone(),
                }),
            ),
        }
    }

    fn apply(&mut self, record: LogRecord) {
        self.next_id = self.next_id.max(record.id + 1);
        self.series
            .entry(record.point.key())
            .or_default()
            .insert(
                record.point.timestamp,
                StoredPoint {
                    id: record.id,
                    point: record.point,
                },
            );
    }

    /// Append records to disk (JSONL format)
    async fn append_to_disk(&self, records: &[LogRecord]) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        if records.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Load existing log into memory (on startup)
    async fn replay(&mut self) -> Result<()> {
        let Some(path) = self.log_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            debug!("No existing point log at {}", path.display());
            return Ok(());
        }

        let file = tokio::fs::File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut replayed = 0usize;
        let mut skipped = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => {
                    self.apply(record);
                    replayed += 1;
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("Skipped {} unreadable lines in {}", skipped, path.display());
        }
        info!(
            "Replayed {} log lines from {}: {} points",
            replayed,
            path.display(),
            self.len()
        );

        Ok(())
    }
}

/// Thread-safe wrapper for HybridPointStore
#[derive(Clone)]
pub struct ConcurrentPointStore {
    store: Arc<RwLock<HybridPointStore>>,
}

impl ConcurrentPointStore {
    pub fn new(store: HybridPointStore) -> Self {
        ConcurrentPointStore {
            store: Arc::new(RwLock::new(store)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(HybridPointStore::in_memory())
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(HybridPointStore::open(path).await?))
    }

    pub async fn upsert(&self, point: DataPoint) -> Result<UpsertOutcome> {
        let mut store = self.store.write().await;
        store.upsert(point).await
    }

    pub async fn bulk_upsert(&self, points: Vec<DataPoint>) -> Result<BulkUpsertReport> {
        let mut store = self.store.write().await;
        store.bulk_upsert(points).await
    }

    pub async fn range_scan(
        &self,
        source: Option<&str>,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<DataPoint> {
        let store = self.store.read().await;
        store.range_scan(source, ticker, from, to)
    }

    pub async fn latest(&self, ticker: &str, source: Option<&str>) -> Option<DataPoint> {
        let store = self.store.read().await;
        store.latest(ticker, source)
    }

    pub async fn coverage(&self, source: Option<&str>, ticker: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let store = self.store.read().await;
        store.coverage(source, ticker)
    }

    pub async fn tickers(&self, source: Option<&str>) -> Vec<String> {
        let store = self.store.read().await;
        store.tickers(source)
    }

    pub async fn id_of(&self, source: &str, ticker: &str, timestamp: DateTime<Utc>) -> Option<u64> {
        let store = self.store.read().await;
        store.id_of(source, ticker, timestamp)
    }

    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.len()
    }

    pub async fn compact(&self) -> Result<()> {
        let mut store = self.store.write().await;
        store.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, hour, 0, 0).unwrap()
    }

    fn point(source: &str, hour: u32, value: f64) -> DataPoint {
        DataPoint::new(source, "WTI", ts(hour), value).with_unit("usd/bbl")
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let mut store = HybridPointStore::in_memory();

        let first = store.upsert(point("test", 1, 70.0)).await.unwrap();
        assert_eq!(first.kind, UpsertKind::Inserted);

        for _ in 0..5 {
            let again = store.upsert(point("test", 1, 70.0)).await.unwrap();
            assert_eq!(again.kind, UpsertKind::Unchanged);
            assert_eq!(again.id, first.id);
        }

        let updated = store.upsert(point("test", 1, 71.0)).await.unwrap();
        assert_eq!(updated.kind, UpsertKind::Updated);
        assert_eq!(updated.previous_value, Some(70.0));
        assert_eq!(updated.id, first.id);

        assert_eq!(store.len(), 1);
        assert_eq!(store.latest("WTI", Some("test")).unwrap().value, 71.0);
    }

    #[tokio::test]
    async fn test_bulk_upsert_reports_conflicts() {
        let mut store = HybridPointStore::in_memory();
        store
            .bulk_upsert(vec![point("test", 1, 70.0), point("test", 2, 70.5)])
            .await
            .unwrap();

        let report = store
            .bulk_upsert(vec![
                point("test", 1, 70.0),
                point("test", 2, 69.0),
                point("test", 3, 71.0),
                point("test", 3, 72.0),
            ])
            .await
            .unwrap();

        assert_eq!(report.count, 4);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 1);
        // hour 2 changed in store, hour 3 changed inside the batch
        assert_eq!(report.conflicts.len(), 2);
        assert_eq!(store.len(), 3);
        assert_eq!(store.latest("WTI", Some("test")).unwrap().value, 72.0);
    }

    #[tokio::test]
    async fn test_bulk_upsert_assigns_distinct_ids() {
        let mut store = HybridPointStore::in_memory();
        store
            .bulk_upsert((0..10).map(|h| point("test", h, h as f64)).collect())
            .await
            .unwrap();

        let mut ids: Vec<u64> = (0..10).filter_map(|h| store.id_of("test", "WTI", ts(h))).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_range_scan_orders_and_filters() {
        let mut store = HybridPointStore::in_memory();
        store
            .bulk_upsert(vec![
                point("b", 3, 3.0),
                point("a", 1, 1.0),
                point("a", 3, 3.5),
                point("a", 5, 5.0),
            ])
            .await
            .unwrap();

        let only_a = store.range_scan(Some("a"), "WTI", ts(1), ts(3));
        assert_eq!(only_a.iter().map(|p| p.value).collect::<Vec<_>>(), vec![1.0, 3.5]);

        let all = store.range_scan(None, "WTI", ts(0), ts(23));
        let order: Vec<(&str, f64)> = all.iter().map(|p| (p.source.as_str(), p.value)).collect();
        assert_eq!(order, vec![("a", 1.0), ("a", 3.5), ("b", 3.0), ("a", 5.0)]);

        assert!(store.range_scan(None, "BRENT", ts(0), ts(23)).is_empty());
        assert!(store.range_scan(None, "WTI", ts(5), ts(1)).is_empty());
    }

    #[tokio::test]
    async fn test_latest_coverage_and_tickers() {
        let mut store = HybridPointStore::in_memory();
        assert!(store.latest("WTI", None).is_none());
        assert!(store.coverage(None, "WTI").is_none());

        store
            .bulk_upsert(vec![
                point("a", 2, 2.0),
                point("b", 7, 7.0),
                DataPoint::new("a", "BRENT", ts(4), 80.0),
            ])
            .await
            .unwrap();

        assert_eq!(store.latest("WTI", None).unwrap().source, "b");
        assert_eq!(store.coverage(None, "WTI"), Some((ts(2), ts(7))));
        assert_eq!(store.coverage(Some("a"), "WTI"), Some((ts(2), ts(2))));
        assert_eq!(store.tickers(None), vec!["BRENT".to_string(), "WTI".to_string()]);
        assert_eq!(store.tickers(Some("b")), vec!["WTI".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_preserves_ids_and_last_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.jsonl");

        let id = {
            let mut store = HybridPointStore::open(&path).await.unwrap();
            let outcome = store.upsert(point("test", 1, 70.0)).await.unwrap();
            store.upsert(point("test", 1, 75.0)).await.unwrap();
            store.upsert(point("test", 2, 76.0)).await.unwrap();
            outcome.id
        };

        let mut reopened = HybridPointStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.id_of("test", "WTI", ts(1)), Some(id));
        assert_eq!(reopened.range_scan(Some("test"), "WTI", ts(1), ts(1))[0].value, 75.0);

        // new ids never collide with replayed ones
        let fresh = reopened.upsert(point("test", 3, 77.0)).await.unwrap();
        assert!(fresh.id > id);

        reopened.compact().await.unwrap();
        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 3);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_one_row() {
        let store = ConcurrentPointStore::in_memory();
        let when = ts(9) + Duration::milliseconds(250);

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(DataPoint::new("test", "WTI", when, i as f64))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }
}
