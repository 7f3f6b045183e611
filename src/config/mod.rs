pub mod loader;
pub mod settings;

pub use loader::{load_config, load_config_from_str};
pub use settings::{
    AggregationConfig, Config, ConnectorKind, FetchConfig, PrefetchConfig, SourceConfig,
    StalenessConfig, StalenessMode, StoreConfig, SyncConfig,
};
