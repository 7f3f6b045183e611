pub mod types;
pub mod error;
pub mod config;
pub mod store;
pub mod quality;
pub mod fetch;
pub mod sync;
pub mod aggregate;
pub mod time;
pub mod utils;

pub use types::*;
pub use error::{Result, SyncError};
pub use config::Config;
pub use sync::{SeriesQuery, SeriesResponse, SyncOrchestrator, SyncStatus};
