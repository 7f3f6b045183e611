/// Wiring of store, registries and policies from configuration
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::freshness::FreshnessPolicy;
use super::orchestrator::{SyncOrchestrator, SyncSettings};
use crate::aggregate::AggregationEngine;
use crate::config::{Config, ConnectorKind};
use crate::error::{Result, SyncError};
use crate::fetch::{CsvDirectoryFetcher, FetcherRegistry, GuardedFetcher, UpstreamFetcher};
use crate::quality::QualityLog;
use crate::store::{ConcurrentPointStore, SourceRegistry};

async fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Connectors for every configured source. CSV sources get a built-in
/// connector; `external` ones must be supplied in `external`.
pub fn build_fetchers(cfg: &Config, external: &FetcherRegistry) -> Result<FetcherRegistry> {
    let timeout = Duration::from_secs(cfg.fetch.timeout_sec);
    let rps = cfg.fetch.requests_per_second;
    let mut registry = FetcherRegistry::new();

    for source in &cfg.sources {
        let inner: Arc<dyn UpstreamFetcher> = match source.kind {
            ConnectorKind::Csv => {
                let dir = source
                    .dir
                    .as_deref()
                    .ok_or_else(|| SyncError::Config(format!("CSV source {} has no dir", source.name)))?;
                Arc::new(CsvDirectoryFetcher::new(source.name.clone(), dir))
            }
            ConnectorKind::External => match external.get(&source.name) {
                Some(fetcher) => fetcher,
                None => {
                    debug!("No connector supplied for external source {}", source.name);
                    continue;
                }
            },
        };
        registry.register(Arc::new(GuardedFetcher::new(inner, rps, timeout)));
    }

    Ok(registry)
}

/// Open durable state and assemble an orchestrator
pub async fn build_orchestrator(cfg: &Config, external: &FetcherRegistry) -> Result<SyncOrchestrator> {
    let store = match &cfg.store.points_path {
        Some(path) => {
            ensure_parent(path).await?;
            ConcurrentPointStore::open(path).await?
        }
        None => ConcurrentPointStore::in_memory(),
    };

    let sources = match &cfg.store.sources_path {
        Some(path) => {
            ensure_parent(path).await?;
            SourceRegistry::new(path)
        }
        None => SourceRegistry::in_memory(),
    };
    sources.load_from_file().await?;
    for source in &cfg.sources {
        sources.provision(&source.name, source.enabled, source.config.clone()).await?;
    }

    let quality = match &cfg.store.quality_log_path {
        Some(path) => {
            ensure_parent(path).await?;
            QualityLog::new(path)
        }
        None => QualityLog::tracing_only(),
    };

    let fetchers = build_fetchers(cfg, external)?;
    let policy = FreshnessPolicy::from_config(&cfg.staleness)?;
    let aggregator = Arc::new(AggregationEngine::new(store.clone()));

    info!(
        "🔧 Sync engine ready: {} points, {} sources, connectors {:?}, staleness {}",
        store.len().await,
        cfg.sources.len(),
        fetchers.sources(),
        policy.describe()
    );

    Ok(SyncOrchestrator::new(
        store,
        Arc::new(sources),
        fetchers,
        policy,
        aggregator,
        Arc::new(quality),
        SyncSettings {
            default_source: cfg.default_source.clone(),
            deadline: Duration::from_secs(cfg.sync.deadline_sec),
            follower_grace: Duration::from_secs(cfg.sync.follower_grace_sec),
        },
    ))
}
