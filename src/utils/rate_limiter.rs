/// Token bucket rate limiter for upstream calls
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: u32,
    refill_rate: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_period(requests_per_second, Duration::from_secs(1))
    }

    /// `capacity` requests per `period`
    pub fn with_period(capacity: u32, period: Duration) -> Self {
        let capacity = capacity.max(1);
        RateLimiter {
            capacity,
            refill_rate: period,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to acquire a token, returns true if successful
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then acquire it
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().await {
                return;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Get current available tokens
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);

        if elapsed >= self.refill_rate {
            let periods = (elapsed.as_secs_f64() / self.refill_rate.as_secs_f64()) as u32;
            bucket.tokens = bucket
                .tokens
                .saturating_add(periods.saturating_mul(self.capacity))
                .min(self.capacity);
            bucket.last_refill = now;
        }
    }
}
