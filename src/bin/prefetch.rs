/// Warm the point store for the configured tickers
/// Usage: cargo run --bin prefetch --release -- [TICKER ...]
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use seriesync::{config::load_config, fetch::FetcherRegistry, sync::build_orchestrator, utils::init_tracing};

#[derive(Parser)]
#[command(name = "prefetch", about = "Warm the point store for a list of tickers")]
struct Cli {
    /// Tickers to warm (default: prefetch.tickers from the configuration)
    tickers: Vec<String>,

    /// Source to refresh (default: configured default_source)
    #[arg(long)]
    source: Option<String>,

    /// Window length in days (default: prefetch.days)
    #[arg(long)]
    days: Option<i64>,

    /// Configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config.log_level, config.log_json);

    info!("🚀 Prefetch utility");
    info!("====================");

    let tickers = if cli.tickers.is_empty() {
        config.prefetch.tickers.clone()
    } else {
        cli.tickers
    };
    if tickers.is_empty() {
        warn!("No tickers given and prefetch.tickers is empty; nothing to do");
        return Ok(());
    }
    let days = cli.days.unwrap_or(config.prefetch.days);

    let orchestrator = build_orchestrator(&config, &FetcherRegistry::new()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = orchestrator
        .aggregator()
        .clone()
        .spawn_periodic(Duration::from_secs(config.aggregation.sweep_interval_sec), shutdown_rx);

    let report = orchestrator.prefetch(&tickers, cli.source.as_deref(), days).await;

    orchestrator.aggregator().sweep(orchestrator.now()).await;
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;

    orchestrator.store().compact().await?;
    info!("✅ Store compacted ({} points)", orchestrator.store().len().await);

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.failed.is_empty() {
        warn!("{} tickers failed", report.failed.len());
    }
    Ok(())
}
