/// OHLC bucket boundaries and computation
use chrono::{DateTime, DurationRound, Utc};

use crate::types::{BucketWidth, DataPoint, OhlcBucket, SeriesKey};

/// Start of the UTC-aligned bucket containing `ts`
pub fn bucket_start(width: BucketWidth, ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(width.duration()).unwrap_or(ts)
}

/// Exclusive end of the bucket starting at `start`
pub fn bucket_end(width: BucketWidth, start: DateTime<Utc>) -> DateTime<Utc> {
    start + width.duration()
}

/// Roll up the points of one bucket. Result depends only on the set of
/// (timestamp, value) pairs, not on input order.
pub fn compute_bucket(
    key: &SeriesKey,
    width: BucketWidth,
    start: DateTime<Utc>,
    points: &[DataPoint],
) -> Option<OhlcBucket> {
    let mut sorted: Vec<&DataPoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.source.cmp(&b.source)));

    let first = sorted.first()?;
    let last = sorted.last()?;

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut sum = 0.0;
    for point in &sorted {
        high = high.max(point.value);
        low = low.min(point.value);
        sum += point.value;
    }

    Some(OhlcBucket {
        source: key.source.clone(),
        ticker: key.ticker.clone(),
        width,
        bucket_start: start,
        open: first.value,
        high,
        low,
        close: last.value,
        avg_value: sum / sorted.len() as f64,
        count: sorted.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_start(BucketWidth::Hour, at(14, 37)), at(14, 0));
        assert_eq!(bucket_start(BucketWidth::Day, at(14, 37)), at(0, 0));
        assert_eq!(bucket_end(BucketWidth::Hour, at(14, 0)), at(15, 0));
    }

    #[test]
    fn test_compute_is_order_independent() {
        let key = SeriesKey::new("test", "WTI");
        let points = vec![
            DataPoint::new("test", "WTI", at(14, 30), 72.0),
            DataPoint::new("test", "WTI", at(14, 5), 70.0),
            DataPoint::new("test", "WTI", at(14, 50), 69.0),
            DataPoint::new("test", "WTI", at(14, 10), 75.0),
        ];
        let mut reversed = points.clone();
        reversed.reverse();

        let bucket = compute_bucket(&key, BucketWidth::Hour, at(14, 0), &points).unwrap();
        assert_eq!(bucket.open, 70.0);
        assert_eq!(bucket.close, 69.0);
        assert_eq!(bucket.high, 75.0);
        assert_eq!(bucket.low, 69.0);
        assert_eq!(bucket.avg_value, 71.5);
        assert_eq!(bucket.count, 4);

        assert_eq!(compute_bucket(&key, BucketWidth::Hour, at(14, 0), &reversed), Some(bucket));
        assert_eq!(compute_bucket(&key, BucketWidth::Hour, at(14, 0), &[]), None);
    }
}
