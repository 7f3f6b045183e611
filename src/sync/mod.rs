pub mod builder;
pub mod freshness;
pub mod orchestrator;
pub mod synchronizer;

pub use builder::{build_fetchers, build_orchestrator};
pub use freshness::{
    staleness_from_config, FixedWindow, FreshnessDecision, FreshnessPolicy, MarketSession, StalenessPolicy,
};
pub use orchestrator::{
    Clock, MergeOutcome, MergeStatus, PrefetchFailure, PrefetchReport, SeriesQuery, SeriesResponse,
    SyncOrchestrator, SyncSettings, SyncStatus,
};
pub use synchronizer::{CoalesceError, KeySynchronizer, Lease, ResultHandle, Ticket};
