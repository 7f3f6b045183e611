pub mod bucket;
pub mod engine;

pub use bucket::{bucket_end, bucket_start, compute_bucket};
pub use engine::AggregationEngine;
