/// Incremental OHLC maintenance over the point store
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::bucket::{bucket_end, bucket_start, compute_bucket};
use crate::store::ConcurrentPointStore;
use crate::types::{BucketWidth, OhlcBucket, SeriesKey, TimeRange};

#[derive(Default)]
struct WidthState {
    buckets: BTreeMap<DateTime<Utc>, OhlcBucket>,
    dirty: BTreeSet<DateTime<Utc>>,
    // Buckets starting at or after this are still filling
    watermark: Option<DateTime<Utc>>,
}

/// Buckets per (source, ticker, width).
///
/// Merges into closed buckets (before the watermark) are applied at once;
/// the live bucket is refreshed by [`AggregationEngine::sweep`], so derived
/// rows lag the store by at most one sweep interval.
pub struct AggregationEngine {
    store: ConcurrentPointStore,
    state: RwLock<HashMap<(SeriesKey, BucketWidth), WidthState>>,
    // Serializes scan-and-write so an older scan never overwrites a newer one
    refresh_lock: Mutex<()>,
}

impl AggregationEngine {
    pub fn new(store: ConcurrentPointStore) -> Self {
        AggregationEngine {
            store,
            state: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Record merged timestamps for `key`
    pub async fn on_merge(&self, key: &SeriesKey, timestamps: &[DateTime<Utc>]) -> usize {
        if timestamps.is_empty() {
            return 0;
        }

        let mut immediate = Vec::new();
        {
            let mut state = self.state.write().await;
            for width in BucketWidth::all() {
                let entry = state.entry((key.clone(), width)).or_default();
                let starts: BTreeSet<DateTime<Utc>> =
                    timestamps.iter().map(|ts| bucket_start(width, *ts)).collect();

                for start in starts {
                    match entry.watermark {
                        Some(mark) if start >= mark => {
                            entry.dirty.insert(start);
                        }
                        _ => immediate.push((width, start)),
                    }
                }
            }
        }

        for (width, start) in &immediate {
            self.refresh_bucket(key, *width, *start).await;
        }

        debug!("{}: {} buckets refreshed on merge", key, immediate.len());
        immediate.len()
    }

    /// Recompute one bucket from the store; an empty bucket is removed
    pub async fn refresh_bucket(&self, key: &SeriesKey, width: BucketWidth, start: DateTime<Utc>) -> Option<OhlcBucket> {
        let _guard = self.refresh_lock.lock().await;

        let end = bucket_end(width, start);
        let points: Vec<_> = self
            .store
            .range_scan(Some(&key.source), &key.ticker, start, end)
            .await
            .into_iter()
            .filter(|p| p.timestamp < end)
            .collect();
        let bucket = compute_bucket(key, width, start, &points);

        let mut state = self.state.write().await;
        let entry = state.entry((key.clone(), width)).or_default();
        entry.dirty.remove(&start);
        match &bucket {
            Some(b) => {
                entry.buckets.insert(start, b.clone());
            }
            None => {
                entry.buckets.remove(&start);
            }
        }

        bucket
    }

    /// Refresh every dirty bucket, then move watermarks to the bucket containing `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let pending: Vec<(SeriesKey, BucketWidth, DateTime<Utc>)> = {
            let mut state = self.state.write().await;
            state
                .iter_mut()
                .flat_map(|((key, width), entry)| {
                    std::mem::take(&mut entry.dirty)
                        .into_iter()
                        .map(move |start| (key.clone(), *width, start))
                })
                .collect()
        };

        for (key, width, start) in &pending {
            self.refresh_bucket(key, *width, *start).await;
        }

        {
            let mut state = self.state.write().await;
            for ((_, width), entry) in state.iter_mut() {
                entry.watermark = Some(bucket_start(*width, now));
            }
        }

        if !pending.is_empty() {
            info!("Aggregation sweep refreshed {} buckets", pending.len());
        }
        pending.len()
    }

    /// Recompute every bucket of `key` from scratch
    pub async fn rebuild(&self, key: &SeriesKey) -> usize {
        let _guard = self.refresh_lock.lock().await;

        let points = match self.store.coverage(Some(&key.source), &key.ticker).await {
            Some((first, last)) => self.store.range_scan(Some(&key.source), &key.ticker, first, last).await,
            None => Vec::new(),
        };

        let mut rebuilt = 0;
        let mut state = self.state.write().await;
        for width in BucketWidth::all() {
            let mut grouped: BTreeMap<DateTime<Utc>, Vec<_>> = BTreeMap::new();
            for point in &points {
                grouped
                    .entry(bucket_start(width, point.timestamp))
                    .or_default()
                    .push(point.clone());
            }

            let entry = state.entry((key.clone(), width)).or_default();
            entry.dirty.clear();
            entry.buckets = grouped
                .iter()
                .filter_map(|(start, pts)| compute_bucket(key, width, *start, pts).map(|b| (*start, b)))
                .collect();
            rebuilt += entry.buckets.len();
        }

        info!("Rebuilt {} buckets for {}", rebuilt, key);
        rebuilt
    }

    /// Buckets with `from <= bucket_start <= to`, ascending
    pub async fn buckets(
        &self,
        key: &SeriesKey,
        width: BucketWidth,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<OhlcBucket> {
        if from > to {
            return Vec::new();
        }
        let state = self.state.read().await;
        state
            .get(&(key.clone(), width))
            .map(|entry| entry.buckets.range(from..=to).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default()
    }

    /// Buckets overlapping `range`, including the one that holds `range.start`
    pub async fn buckets_over(&self, key: &SeriesKey, width: BucketWidth, range: TimeRange) -> Vec<OhlcBucket> {
        self.buckets(key, width, bucket_start(width, range.start), range.end).await
    }

    pub async fn dirty_count(&self) -> usize {
        let state = self.state.read().await;
        state.values().map(|entry| entry.dirty.len()).sum()
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Aggregation sweep every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Aggregation sweep stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
