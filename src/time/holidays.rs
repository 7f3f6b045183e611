/// Exchange holiday calendar loading
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;

use crate::error::{Result, SyncError};

/// Parse configured holiday dates (`YYYY-MM-DD`)
pub fn parse_holidays(dates: &[String]) -> Result<HashSet<NaiveDate>> {
    let mut holidays = HashSet::with_capacity(dates.len());

    for raw in dates {
        let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|e| SyncError::Config(format!("Invalid holiday date '{}': {}", raw, e)))?;
        holidays.insert(date);
    }

    Ok(holidays)
}

/// Saturday or Sunday
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_holidays() {
        let dates = vec!["2025-12-25".to_string(), " 2025-01-01 ".to_string()];
        let holidays = parse_holidays(&dates).unwrap();

        assert_eq!(holidays.len(), 2);
        assert!(holidays.contains(&NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_holidays(&["25/12/2025".to_string()]).unwrap_err();
        assert_eq!(err.error_code(), "CFG_001");
    }

    #[test]
    fn test_weekend() {
        let sat = NaiveDate::from_ymd_opt(2025, 1, 4).unwrap(); // Saturday
        let sun = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(); // Sunday
        let mon = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        assert!(is_weekend(sat));
        assert!(is_weekend(sun));
        assert!(!is_weekend(mon));
    }
}
