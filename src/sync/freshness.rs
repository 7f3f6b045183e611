/// Freshness decision: serve the store as-is or fetch a forward gap
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::config::{StalenessConfig, StalenessMode};
use crate::error::{Result, SyncError};
use crate::time::{parse_holidays, MarketCalendar};
use crate::types::TimeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FreshnessDecision {
    /// Newest point is within the staleness floor. `head_truncated` is set when
    /// stored history begins after the requested start.
    Fresh { head_truncated: bool },
    Stale { gap: TimeRange },
    ForceRefresh { range: TimeRange },
}

impl FreshnessDecision {
    /// Range to fetch, if any
    pub fn fetch_range(&self) -> Option<TimeRange> {
        match self {
            FreshnessDecision::Fresh { .. } => None,
            FreshnessDecision::Stale { gap } => Some(*gap),
            FreshnessDecision::ForceRefresh { range } => Some(*range),
        }
    }
}

/// Oldest acceptable timestamp for the newest stored point
pub trait StalenessPolicy: Send + Sync {
    fn staleness_floor(&self, now: DateTime<Utc>) -> DateTime<Utc>;

    fn describe(&self) -> String;
}

/// Newest point must be younger than `threshold`
#[derive(Debug, Clone)]
pub struct FixedWindow {
    threshold: Duration,
}

impl FixedWindow {
    pub fn new(threshold: Duration) -> Self {
        FixedWindow { threshold }
    }
}

impl StalenessPolicy for FixedWindow {
    fn staleness_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.threshold
    }

    fn describe(&self) -> String {
        format!("fixed window of {} min", self.threshold.num_minutes())
    }
}

/// Outside trading hours the floor pins to the last session close, so data
/// captured at the close stays fresh overnight and across weekends.
#[derive(Debug, Clone)]
pub struct MarketSession {
    calendar: MarketCalendar,
    threshold: Duration,
}

impl MarketSession {
    pub fn new(calendar: MarketCalendar, threshold: Duration) -> Self {
        MarketSession { calendar, threshold }
    }
}

impl StalenessPolicy for MarketSession {
    fn staleness_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.calendar.is_open(now) {
            return now - self.threshold;
        }
        match self.calendar.last_completed_close(now) {
            Some(close) => close - self.threshold,
            None => now - self.threshold,
        }
    }

    fn describe(&self) -> String {
        format!(
            "market session ({}) with {} min threshold",
            self.calendar.timezone(),
            self.threshold.num_minutes()
        )
    }
}

fn parse_session_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .map_err(|e| SyncError::Config(format!("Invalid session time '{}': {}", raw, e)))
}

/// Build the staleness policy selected in configuration
pub fn staleness_from_config(cfg: &StalenessConfig) -> Result<Arc<dyn StalenessPolicy>> {
    let threshold = Duration::minutes(cfg.threshold_minutes);

    match cfg.mode {
        StalenessMode::Fixed => Ok(Arc::new(FixedWindow::new(threshold))),
        StalenessMode::MarketSession => {
            let timezone: Tz = cfg
                .timezone
                .parse()
                .map_err(|e| SyncError::Config(format!("Invalid timezone '{}': {}", cfg.timezone, e)))?;
            let open = parse_session_time(&cfg.session_open)?;
            let close = parse_session_time(&cfg.session_close)?;
            if close <= open {
                return Err(SyncError::Config(format!(
                    "Session close {} must be after open {}",
                    cfg.session_close, cfg.session_open
                )));
            }
            let holidays = parse_holidays(&cfg.holidays)?;

            Ok(Arc::new(MarketSession::new(
                MarketCalendar::new(timezone, open, close, holidays),
                threshold,
            )))
        }
    }
}

/// Pure decision function over stored coverage
#[derive(Clone)]
pub struct FreshnessPolicy {
    staleness: Arc<dyn StalenessPolicy>,
}

impl FreshnessPolicy {
    pub fn new(staleness: Arc<dyn StalenessPolicy>) -> Self {
        FreshnessPolicy { staleness }
    }

    pub fn fixed(threshold: Duration) -> Self {
        Self::new(Arc::new(FixedWindow::new(threshold)))
    }

    pub fn from_config(cfg: &StalenessConfig) -> Result<Self> {
        Ok(Self::new(staleness_from_config(cfg)?))
    }

    pub fn describe(&self) -> String {
        self.staleness.describe()
    }

    /// `required` is the window the caller asked for, ending at `now`.
    /// `coverage` is (first, last) stored timestamp for the key.
    /// Gaps are forward-only: history before the first point is never backfilled
    /// without `force_refresh`.
    pub fn decide(
        &self,
        required: TimeRange,
        force_refresh: bool,
        now: DateTime<Utc>,
        coverage: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> FreshnessDecision {
        if force_refresh {
            return FreshnessDecision::ForceRefresh { range: required };
        }

        let Some((first, newest)) = coverage else {
            return FreshnessDecision::Stale { gap: required };
        };

        if newest >= self.staleness.staleness_floor(now) {
            return FreshnessDecision::Fresh {
                head_truncated: first > required.start,
            };
        }

        FreshnessDecision::Stale {
            gap: TimeRange::new(newest.max(required.start), now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn last(days: i64) -> TimeRange {
        TimeRange::last_days(now(), days).unwrap()
    }

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::fixed(Duration::minutes(60))
    }

    #[test]
    fn test_empty_store_needs_full_range() {
        let decision = policy().decide(last(5), false, now(), None);
        assert_eq!(
            decision,
            FreshnessDecision::Stale {
                gap: last(5)
            }
        );
    }

    #[test]
    fn test_forward_gap_starts_at_newest_point() {
        let first = now() - Duration::days(10);
        let newest = now() - Duration::days(1);

        let decision = policy().decide(last(5), false, now(), Some((first, newest)));
        assert_eq!(
            decision,
            FreshnessDecision::Stale {
                gap: TimeRange::new(newest, now())
            }
        );
    }

    #[test]
    fn test_gap_clamped_to_requested_window() {
        let newest = now() - Duration::days(30);
        let decision = policy().decide(last(5), false, now(), Some((newest - Duration::days(1), newest)));
        assert_eq!(decision.fetch_range(), Some(last(5)));
    }

    #[test]
    fn test_fresh_and_head_truncated() {
        let newest = now() - Duration::minutes(10);

        let covered = policy().decide(last(5), false, now(), Some((now() - Duration::days(6), newest)));
        assert_eq!(covered, FreshnessDecision::Fresh { head_truncated: false });

        let short = policy().decide(last(5), false, now(), Some((now() - Duration::days(2), newest)));
        assert_eq!(short, FreshnessDecision::Fresh { head_truncated: true });
        assert_eq!(short.fetch_range(), None);
    }

    #[test]
    fn test_force_refresh_overrides_fresh_data() {
        let decision = policy().decide(last(3), true, now(), Some((now() - Duration::days(9), now())));
        assert_eq!(
            decision,
            FreshnessDecision::ForceRefresh {
                range: last(3)
            }
        );
    }

    #[test]
    fn test_market_session_floor_after_close() {
        let calendar = MarketCalendar::new(
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            HashSet::new(),
        );
        let staleness = MarketSession::new(calendar, Duration::minutes(15));

        // Saturday 2025-03-08 15:00 UTC: market closed since Friday 16:00 EST (21:00 UTC)
        let saturday = Utc.with_ymd_and_hms(2025, 3, 8, 15, 0, 0).unwrap();
        let friday_close = Utc.with_ymd_and_hms(2025, 3, 7, 21, 0, 0).unwrap();
        assert_eq!(staleness.staleness_floor(saturday), friday_close - Duration::minutes(15));

        // Monday 2025-03-10 14:00 UTC is 10:00 EDT, in session
        let monday = Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap();
        assert_eq!(staleness.staleness_floor(monday), monday - Duration::minutes(15));

        let policy = FreshnessPolicy::new(Arc::new(staleness));
        let at_close = friday_close - Duration::minutes(1);
        let required = TimeRange::last_days(saturday, 5).unwrap();
        assert!(matches!(
            policy.decide(required, false, saturday, Some((saturday - Duration::days(10), at_close))),
            FreshnessDecision::Fresh { .. }
        ));
    }

    #[test]
    fn test_staleness_from_config() {
        let cfg = StalenessConfig {
            mode: StalenessMode::MarketSession,
            timezone: "Europe/London".to_string(),
            holidays: vec!["2025-12-25".to_string()],
            ..StalenessConfig::default()
        };
        let staleness = staleness_from_config(&cfg).unwrap();
        assert!(staleness.describe().contains("Europe/London"));

        let bad = StalenessConfig {
            mode: StalenessMode::MarketSession,
            session_open: "18:00".to_string(),
            ..StalenessConfig::default()
        };
        assert!(staleness_from_config(&bad).is_err());
    }
}
