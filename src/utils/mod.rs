pub mod idempotency;
pub mod logging;
pub mod rate_limiter;

pub use idempotency::generate_idempotency_key;
pub use logging::init_tracing;
pub use rate_limiter::RateLimiter;
