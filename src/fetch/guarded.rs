/// Rate limiting and deadline enforcement in front of a connector
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{FetchError, UpstreamFetcher};
use crate::types::{DataPoint, TimeRange};
use crate::utils::RateLimiter;

pub struct GuardedFetcher {
    inner: Arc<dyn UpstreamFetcher>,
    limiter: RateLimiter,
    timeout: Duration,
}

impl GuardedFetcher {
    pub fn new(inner: Arc<dyn UpstreamFetcher>, requests_per_second: u32, timeout: Duration) -> Self {
        GuardedFetcher {
            inner,
            limiter: RateLimiter::new(requests_per_second),
            timeout,
        }
    }
}

#[async_trait]
impl UpstreamFetcher for GuardedFetcher {
    fn source(&self) -> &str {
        self.inner.source()
    }

    async fn fetch(&self, ticker: &str, range: TimeRange) -> Result<Vec<DataPoint>, FetchError> {
        let call = async {
            self.limiter.acquire().await;
            self.inner.fetch(ticker, range).await
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(mut points)) => {
                points.sort_by_key(|p| p.timestamp);
                debug!("{} returned {} points for {}", self.source(), points.len(), ticker);
                Ok(points)
            }
            Ok(Err(FetchError::PartialData { mut points, cause })) => {
                points.sort_by_key(|p| p.timestamp);
                Err(FetchError::PartialData { points, cause })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("{} fetch for {} exceeded {:?}", self.source(), ticker, self.timeout);
                Err(FetchError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    struct Slow;

    #[async_trait]
    impl UpstreamFetcher for Slow {
        fn source(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _ticker: &str, _range: TimeRange) -> Result<Vec<DataPoint>, FetchError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct Unordered;

    #[async_trait]
    impl UpstreamFetcher for Unordered {
        fn source(&self) -> &str {
            "unordered"
        }

        async fn fetch(&self, ticker: &str, range: TimeRange) -> Result<Vec<DataPoint>, FetchError> {
            Ok(vec![
                DataPoint::new("unordered", ticker, range.end, 2.0),
                DataPoint::new("unordered", ticker, range.start, 1.0),
            ])
        }
    }

    fn range() -> TimeRange {
        let end = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        TimeRange::new(end - ChronoDuration::days(1), end)
    }

    #[tokio::test]
    async fn test_timeout_maps_to_fetch_error() {
        let guarded = GuardedFetcher::new(Arc::new(Slow), 10, Duration::from_millis(50));
        let err = guarded.fetch("WTI", range()).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_points_come_back_sorted() {
        let guarded = GuardedFetcher::new(Arc::new(Unordered), 10, Duration::from_secs(1));
        let points = guarded.fetch("WTI", range()).await.unwrap();
        assert_eq!(points.iter().map(|p| p.value).collect::<Vec<_>>(), vec![1.0, 2.0]);
        assert_eq!(guarded.source(), "unordered");
    }
}
