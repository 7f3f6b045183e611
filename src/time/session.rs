/// Market session calendar
use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::holidays::is_weekend;

/// How far back to look for a completed session before giving up
const MAX_LOOKBACK_DAYS: i64 = 31;

/// Trading calendar of one exchange: local session hours, weekends, holidays
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(timezone: Tz, open: NaiveTime, close: NaiveTime, holidays: HashSet<NaiveDate>) -> Self {
        MarketCalendar {
            timezone,
            open,
            close,
            holidays,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Check if a local date is a trading day (not weekend, not holiday)
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    /// Session open/close in UTC for a local date
    pub fn session_bounds(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let open = self
            .timezone
            .from_local_datetime(&date.and_time(self.open))
            .earliest()?
            .with_timezone(&Utc);
        let close = self
            .timezone
            .from_local_datetime(&date.and_time(self.close))
            .latest()?
            .with_timezone(&Utc);

        Some((open, close))
    }

    /// Check if the market is in session at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local_date = now.with_timezone(&self.timezone).date_naive();
        if !self.is_trading_day(local_date) {
            return false;
        }

        match self.session_bounds(local_date) {
            Some((open, close)) => now >= open && now < close,
            None => false,
        }
    }

    /// Close of the most recent session that ended at or before `now`
    pub fn last_completed_close(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&self.timezone).date_naive();

        (0..=MAX_LOOKBACK_DAYS)
            .map(|back| today - Duration::days(back))
            .filter(|date| self.is_trading_day(*date))
            .filter_map(|date| self.session_bounds(date))
            .map(|(_, close)| close)
            .find(|close| *close <= now)
    }
}
