/// Read-through synchronization of time series.
///
/// A query is answered from the point store. When the stored data is stale
/// (or a refresh is forced) one leader per key fetches the missing range,
/// validates and merges it, and every caller then reads the merged store.
/// Refresh failures never discard cached data: the response is degraded
/// instead.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::freshness::{FreshnessDecision, FreshnessPolicy};
use super::synchronizer::{CoalesceError, KeySynchronizer, Ticket};
use crate::aggregate::AggregationEngine;
use crate::error::{Result, SyncError};
use crate::fetch::{FetchError, FetcherRegistry};
use crate::quality::QualityLog;
use crate::store::{ConcurrentPointStore, SourceRegistry, SyncAttempt};
use crate::types::{DataPoint, QualityEvent, QualityIssue, SeriesKey, TimeRange, RESERVED_METADATA_KEYS};

/// Source of "now"; swapped for a fixed instant in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub ticker: String,
    #[serde(default)]
    pub source: Option<String>,
    pub days: i64,
    #[serde(default)]
    pub force_refresh: bool,
}

impl SeriesQuery {
    pub fn new(ticker: impl Into<String>, days: i64) -> Self {
        SeriesQuery {
            ticker: ticker.into(),
            source: None,
            days,
            force_refresh: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    /// Check the query and resolve the window it asks for, ending at `now`
    fn validate(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        if self.days <= 0 {
            return Err(SyncError::InvalidRequest(format!("days must be positive, got {}", self.days)));
        }
        check_name("ticker", &self.ticker)?;
        if let Some(source) = &self.source {
            check_name("source", source)?;
        }
        TimeRange::last_days(now, self.days).ok_or_else(|| {
            SyncError::InvalidRequest(format!("days {} reaches past the supported time range", self.days))
        })
    }
}

fn check_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::InvalidRequest(format!("{} must not be empty", field)));
    }
    if value.chars().any(|c| c.is_ascii_control()) {
        return Err(SyncError::InvalidRequest(format!("{} contains control characters", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Served from the store without fetching
    Fresh,
    Refreshed,
    PartialRefresh { cause: String },
    /// Refresh failed; cached points were served
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesResponse {
    pub ticker: String,
    pub source: Option<String>,
    pub requested: TimeRange,
    #[serde(flatten)]
    pub status: SyncStatus,
    /// Stored history starts after the requested start
    pub head_truncated: bool,
    pub fetched_range: Option<TimeRange>,
    /// Whether this caller led the refresh; `None` when nothing was fetched
    pub leader: Option<bool>,
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeStatus {
    /// Another cycle made the key fresh before this leader started
    AlreadyFresh,
    Complete,
    Partial(String),
    Failed { reason: String, timeout: Option<Duration> },
}

/// Outcome of one fetch-and-merge cycle, shared by every coalesced caller
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub run_id: Uuid,
    pub fetched: usize,
    pub merged: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub status: MergeStatus,
}

impl MergeOutcome {
    fn failed(run_id: Uuid, reason: impl Into<String>, timeout: Option<Duration>) -> Self {
        MergeOutcome {
            run_id,
            fetched: 0,
            merged: 0,
            rejected: 0,
            conflicts: 0,
            status: MergeStatus::Failed {
                reason: reason.into(),
                timeout,
            },
        }
    }

    fn already_fresh(run_id: Uuid) -> Self {
        MergeOutcome {
            run_id,
            fetched: 0,
            merged: 0,
            rejected: 0,
            conflicts: 0,
            status: MergeStatus::AlreadyFresh,
        }
    }

    fn from_coalesce(err: CoalesceError) -> Self {
        let timeout = match &err {
            CoalesceError::Timeout(d) => Some(*d),
            CoalesceError::Abandoned => None,
        };
        Self::failed(Uuid::nil(), err.to_string(), timeout)
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Source fetched when a query does not name one
    pub default_source: String,
    /// Upper bound on one fetch-and-merge cycle
    pub deadline: Duration,
    /// Extra wait granted to callers beyond the deadline
    pub follower_grace: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            default_source: "default".to_string(),
            deadline: Duration::from_secs(60),
            follower_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetchFailure {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetchReport {
    pub requested: usize,
    pub fresh: usize,
    pub refreshed: usize,
    pub partial: usize,
    pub degraded: usize,
    pub failed: Vec<PrefetchFailure>,
}

/// Everything the leader task needs, cloneable into a spawned future
#[derive(Clone)]
struct MergePipeline {
    store: ConcurrentPointStore,
    sources: Arc<SourceRegistry>,
    fetchers: Arc<FetcherRegistry>,
    aggregator: Arc<AggregationEngine>,
    quality: Arc<QualityLog>,
    policy: FreshnessPolicy,
    clock: Clock,
}

impl MergePipeline {
    /// Fetch `gap` and merge it. `recheck` is the requested window of an
    /// unforced refresh: the leader reads coverage again and skips the fetch
    /// when a cycle that finished in the meantime already made the key fresh.
    async fn run(self, key: SeriesKey, gap: TimeRange, recheck: Option<TimeRange>) -> MergeOutcome {
        let run_id = Uuid::new_v4();
        let now = (self.clock)();

        if let Some(required) = recheck {
            let coverage = self.store.coverage(Some(&key.source), &key.ticker).await;
            if let FreshnessDecision::Fresh { .. } = self.policy.decide(required, false, now, coverage) {
                debug!(%run_id, "{} became fresh before the refresh started", key);
                return MergeOutcome::already_fresh(run_id);
            }
        }

        if !self.sources.is_enabled(&key.source).await {
            let reason = format!("source {} is disabled or not provisioned", key.source);
            warn!(%run_id, "⚠️  Skipping refresh of {}: {}", key, reason);
            return MergeOutcome::failed(run_id, reason, None);
        }

        let Some(fetcher) = self.fetchers.get(&key.source) else {
            let reason = format!("no fetcher registered for source {}", key.source);
            warn!(%run_id, "⚠️  Skipping refresh of {}: {}", key, reason);
            self.record(&key.source, now, SyncAttempt::Failed(reason.clone())).await;
            return MergeOutcome::failed(run_id, reason, None);
        };

        info!(%run_id, "📥 Fetching {} {}", key, gap);
        let (points, status) = match fetcher.fetch(&key.ticker, gap).await {
            Ok(points) => (points, MergeStatus::Complete),
            Err(FetchError::PartialData { points, cause }) => {
                warn!(%run_id, "⚠️  Partial fetch for {}: {}", key, cause);
                (points, MergeStatus::Partial(cause))
            }
            Err(e) => {
                error!(%run_id, code = e.error_code(), "❌ Fetch failed for {}: {}", key, e);
                self.record(&key.source, now, SyncAttempt::Failed(e.to_string())).await;
                let timeout = match e {
                    FetchError::Timeout(d) => Some(d),
                    _ => None,
                };
                return MergeOutcome::failed(run_id, e.to_string(), timeout);
            }
        };

        let fetched = points.len();
        let (valid, mut events) = validate_points(&key, points, now);
        let rejected = fetched - valid.len();

        if fetched == 0 && status == MergeStatus::Complete {
            events.push(QualityLog::event(
                &key.source,
                &key.ticker,
                QualityIssue::MissingData,
                format!("upstream returned no points for {}", gap),
                now,
            ));
        }

        let timestamps: Vec<DateTime<Utc>> = valid.iter().map(|p| p.timestamp).collect();
        let report = match self.store.bulk_upsert(valid).await {
            Ok(report) => report,
            Err(e) => {
                error!(%run_id, code = e.error_code(), "❌ Merge failed for {}: {}", key, e);
                self.record(&key.source, now, SyncAttempt::Failed(e.to_string())).await;
                self.log_quality(events).await;
                return MergeOutcome::failed(run_id, e.to_string(), None);
            }
        };

        for conflict in &report.conflicts {
            events.push(QualityLog::event(
                &conflict.source,
                &conflict.ticker,
                QualityIssue::DuplicateConflict,
                format!(
                    "value at {} changed from {} to {}",
                    conflict.timestamp.to_rfc3339(),
                    conflict.previous,
                    conflict.current
                ),
                now,
            ));
        }
        self.log_quality(events).await;

        let attempt = match &status {
            MergeStatus::Partial(cause) => SyncAttempt::Partial(cause.clone()),
            _ => SyncAttempt::Succeeded,
        };
        self.record(&key.source, now, attempt).await;
        self.aggregator.on_merge(&key, &timestamps).await;

        info!(
            %run_id,
            "✅ Merged {} for {}: {} inserted, {} updated, {} unchanged, {} rejected",
            report.count,
            key,
            report.inserted,
            report.updated,
            report.unchanged,
            rejected
        );

        MergeOutcome {
            run_id,
            fetched,
            merged: report.count,
            rejected,
            conflicts: report.conflicts.len(),
            status,
        }
    }

    async fn record(&self, source: &str, at: DateTime<Utc>, attempt: SyncAttempt) {
        if let Err(e) = self.sources.record_attempt(source, at, attempt).await {
            warn!("Failed to persist source state for {}: {}", source, e);
        }
    }

    async fn log_quality(&self, events: Vec<QualityEvent>) {
        if let Err(e) = self.quality.record_all(events).await {
            warn!("Failed to write quality log: {}", e);
        }
    }
}

/// Drop non-finite values and pin identity fields to `key`
fn validate_points(key: &SeriesKey, points: Vec<DataPoint>, now: DateTime<Utc>) -> (Vec<DataPoint>, Vec<QualityEvent>) {
    let mut valid = Vec::with_capacity(points.len());
    let mut events = Vec::new();

    for mut point in points {
        if !point.value.is_finite() {
            events.push(QualityLog::event(
                &key.source,
                &key.ticker,
                QualityIssue::InvalidValue,
                format!("non-finite value {} at {}", point.value, point.timestamp.to_rfc3339()),
                now,
            ));
            continue;
        }

        if point.source != key.source || point.ticker != key.ticker {
            debug!("Re-keying point {}:{} to {}", point.source, point.ticker, key);
            point.source = key.source.clone();
            point.ticker = key.ticker.clone();
        }
        for reserved in RESERVED_METADATA_KEYS {
            point.metadata.remove(*reserved);
        }
        valid.push(point);
    }

    (valid, events)
}

pub struct SyncOrchestrator {
    pipeline: MergePipeline,
    synchronizer: KeySynchronizer<MergeOutcome>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: ConcurrentPointStore,
        sources: Arc<SourceRegistry>,
        fetchers: FetcherRegistry,
        policy: FreshnessPolicy,
        aggregator: Arc<AggregationEngine>,
        quality: Arc<QualityLog>,
        settings: SyncSettings,
    ) -> Self {
        SyncOrchestrator {
            pipeline: MergePipeline {
                store,
                sources,
                fetchers: Arc::new(fetchers),
                aggregator,
                quality,
                policy,
                clock: Arc::new(Utc::now),
            },
            synchronizer: KeySynchronizer::new(settings.deadline),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.pipeline.clock = clock;
        self
    }

    pub fn store(&self) -> &ConcurrentPointStore {
        &self.pipeline.store
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.pipeline.sources
    }

    pub fn aggregator(&self) -> &Arc<AggregationEngine> {
        &self.pipeline.aggregator
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn in_flight(&self) -> usize {
        self.synchronizer.in_flight()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.pipeline.clock)()
    }

    /// Serve `query`, refreshing the store first when it is stale
    pub async fn get_series(&self, query: SeriesQuery) -> Result<SeriesResponse> {
        let now = self.now();
        let requested = query.validate(now)?;
        let fetch_source = query
            .source
            .clone()
            .unwrap_or_else(|| self.settings.default_source.clone());
        let key = SeriesKey::new(fetch_source, query.ticker.clone());

        let coverage = self.pipeline.store.coverage(Some(&key.source), &key.ticker).await;
        let decision = self.pipeline.policy.decide(requested, query.force_refresh, now, coverage);
        debug!("{} over {}: {:?}", key, requested, decision);

        let Some(fetch_range) = decision.fetch_range() else {
            let head_truncated = matches!(decision, FreshnessDecision::Fresh { head_truncated: true });
            let points = self.scan(&query, requested).await;
            return Ok(SeriesResponse {
                ticker: query.ticker,
                source: query.source,
                requested,
                status: SyncStatus::Fresh,
                head_truncated,
                fetched_range: None,
                leader: None,
                points,
            });
        };

        let recheck = (!query.force_refresh).then_some(requested);
        let (outcome, leader) = self.refresh(&key, fetch_range, recheck).await;
        let points = self.scan(&query, requested).await;
        let head_truncated = points.first().map_or(false, |p| p.timestamp > requested.start);
        let fetched_range = (outcome.status != MergeStatus::AlreadyFresh).then_some(fetch_range);

        let status = match outcome.status {
            MergeStatus::AlreadyFresh => SyncStatus::Fresh,
            MergeStatus::Complete => SyncStatus::Refreshed,
            MergeStatus::Partial(cause) => SyncStatus::PartialRefresh { cause },
            MergeStatus::Failed { reason, timeout } => {
                if points.is_empty() {
                    warn!("❌ No data for {}: {}", key, reason);
                    return Err(match timeout {
                        Some(d) => SyncError::Timeout(d),
                        None => SyncError::NoData(format!("{}: {}", key, reason)),
                    });
                }
                warn!("⚠️  Serving {} cached points for {} (degraded: {})", points.len(), key, reason);
                SyncStatus::Degraded { reason }
            }
        };

        Ok(SeriesResponse {
            ticker: query.ticker,
            source: query.source,
            requested,
            status,
            head_truncated,
            fetched_range,
            leader: Some(leader),
            points,
        })
    }

    /// Warm the store for several tickers. Individual failures are reported,
    /// never propagated.
    pub async fn prefetch(&self, tickers: &[String], source: Option<&str>, days: i64) -> PrefetchReport {
        let queries = tickers.iter().map(|ticker| {
            let mut query = SeriesQuery::new(ticker.clone(), days);
            query.source = source.map(str::to_string);
            async move { (query.ticker.clone(), self.get_series(query).await) }
        });

        let mut report = PrefetchReport {
            requested: tickers.len(),
            ..PrefetchReport::default()
        };

        for (ticker, result) in join_all(queries).await {
            match result {
                Ok(response) => match response.status {
                    SyncStatus::Fresh => report.fresh += 1,
                    SyncStatus::Refreshed => report.refreshed += 1,
                    SyncStatus::PartialRefresh { .. } => report.partial += 1,
                    SyncStatus::Degraded { .. } => report.degraded += 1,
                },
                Err(e) => report.failed.push(PrefetchFailure {
                    ticker,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            "📊 Prefetch: {} requested, {} fresh, {} refreshed, {} partial, {} degraded, {} failed",
            report.requested,
            report.fresh,
            report.refreshed,
            report.partial,
            report.degraded,
            report.failed.len()
        );
        report
    }

    async fn scan(&self, query: &SeriesQuery, range: TimeRange) -> Vec<DataPoint> {
        self.pipeline
            .store
            .range_scan(query.source.as_deref(), &query.ticker, range.start, range.end)
            .await
    }

    /// Lead or join the refresh cycle for `key`; returns the outcome and
    /// whether this caller was the leader
    async fn refresh(&self, key: &SeriesKey, range: TimeRange, recheck: Option<TimeRange>) -> (MergeOutcome, bool) {
        let wait = self.settings.deadline + self.settings.follower_grace;

        match self.synchronizer.acquire_or_join(key) {
            Ticket::Leader(lease, handle) => {
                lease.spawn(self.pipeline.clone().run(key.clone(), range, recheck));
                let outcome = handle.wait(wait).await.unwrap_or_else(MergeOutcome::from_coalesce);
                (outcome, true)
            }
            Ticket::Follower(handle) => {
                debug!("Waiting on in-flight refresh of {}", key);
                let outcome = handle.wait(wait).await.unwrap_or_else(MergeOutcome::from_coalesce);
                (outcome, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::fetch::UpstreamFetcher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamFetcher for CountingFetcher {
        fn source(&self) -> &str {
            "test"
        }

        async fn fetch(&self, ticker: &str, range: TimeRange) -> std::result::Result<Vec<DataPoint>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![DataPoint::new("test", ticker, range.end, 71.0)])
        }
    }

    async fn pipeline(store: ConcurrentPointStore, fetcher: Arc<CountingFetcher>) -> MergePipeline {
        let sources = Arc::new(SourceRegistry::in_memory());
        sources.provision("test", true, serde_json::Value::Null).await.unwrap();
        let mut fetchers = FetcherRegistry::new();
        fetchers.register(fetcher);

        MergePipeline {
            aggregator: Arc::new(AggregationEngine::new(store.clone())),
            store,
            sources,
            fetchers: Arc::new(fetchers),
            quality: Arc::new(QualityLog::tracing_only()),
            policy: FreshnessPolicy::fixed(chrono::Duration::minutes(60)),
            clock: Arc::new(now),
        }
    }

    #[test]
    fn test_query_validation() {
        let range = SeriesQuery::new("WTI", 5).validate(now()).unwrap();
        assert_eq!(range, TimeRange::last_days(now(), 5).unwrap());

        assert!(SeriesQuery::new("WTI", 0).validate(now()).is_err());
        assert!(SeriesQuery::new("", 5).validate(now()).is_err());
        assert!(SeriesQuery::new("WT\u{7}I", 5).validate(now()).is_err());
        assert!(SeriesQuery::new("WTI", 5).with_source(" ").validate(now()).is_err());
    }

    #[test]
    fn test_query_days_past_time_range_rejected() {
        for days in [100_000_000, i64::MAX] {
            let err = SeriesQuery::new("WTI", days).validate(now()).unwrap_err();
            assert!(matches!(err, SyncError::InvalidRequest(_)), "{days}: {err}");
        }
    }

    #[tokio::test]
    async fn test_leader_rechecks_freshness_before_fetching() {
        let store = ConcurrentPointStore::in_memory();
        let fetcher = Arc::new(CountingFetcher::default());
        let pipeline = pipeline(store.clone(), fetcher.clone()).await;
        let key = SeriesKey::new("test", "WTI");
        let required = TimeRange::last_days(now(), 5).unwrap();
        let gap = TimeRange::new(now() - chrono::Duration::days(1), now());

        // a cycle that finished after the caller read coverage
        store
            .upsert(DataPoint::new("test", "WTI", now() - chrono::Duration::minutes(5), 70.5))
            .await
            .unwrap();

        let outcome = pipeline.clone().run(key.clone(), gap, Some(required)).await;
        assert_eq!(outcome.status, MergeStatus::AlreadyFresh);
        assert_eq!(outcome.fetched, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        // forced refreshes skip the recheck
        let outcome = pipeline.run(key, gap, None).await;
        assert_eq!(outcome.status, MergeStatus::Complete);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validate_points_rekeys_and_filters() {
        let key = SeriesKey::new("test", "WTI");
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let points = vec![
            DataPoint::new("other", "wti", now, 70.0).with_metadata("source", serde_json::json!("spoofed")),
            DataPoint::new("test", "WTI", now, f64::NAN),
            DataPoint::new("test", "WTI", now, f64::INFINITY),
        ];

        let (valid, events) = validate_points(&key, points, now);

        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].key(), key);
        assert!(valid[0].metadata.is_empty());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == QualityIssue::InvalidValue));
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(SyncStatus::Degraded {
            reason: "upstream down".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "upstream down");
    }
}
