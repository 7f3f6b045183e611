pub mod point_store;
pub mod source_state;

pub use point_store::{
    BulkUpsertReport, ConcurrentPointStore, HybridPointStore, UpsertKind, UpsertOutcome, ValueConflict,
};
pub use source_state::{SourceRegistry, SyncAttempt};
