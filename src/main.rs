/// One-shot series query: refresh if stale, print the response as JSON
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use seriesync::{
    config::load_config,
    fetch::FetcherRegistry,
    sync::build_orchestrator,
    utils::init_tracing,
    BucketWidth, SeriesKey, SeriesQuery,
};

#[derive(Parser)]
#[command(name = "seriesync", about = "Read-through time series query")]
struct Cli {
    /// Ticker to query
    ticker: String,

    /// Source to read and refresh (default: configured default_source)
    #[arg(long)]
    source: Option<String>,

    /// Length of the requested window in days
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Refetch the whole window even when the store is fresh
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Also print OHLC buckets of this width over the window
    #[arg(long, value_enum)]
    buckets: Option<BucketArg>,

    /// Configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum BucketArg {
    Hour,
    Day,
}

impl From<BucketArg> for BucketWidth {
    fn from(arg: BucketArg) -> Self {
        match arg {
            BucketArg::Hour => BucketWidth::Hour,
            BucketArg::Day => BucketWidth::Day,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config.log_level, config.log_json);

    info!("🚀 seriesync query for {}", cli.ticker);
    let orchestrator = build_orchestrator(&config, &FetcherRegistry::new()).await?;

    let query = SeriesQuery {
        ticker: cli.ticker.clone(),
        source: cli.source.clone(),
        days: cli.days,
        force_refresh: cli.force,
    };
    let response = orchestrator.get_series(query).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if let Some(width) = cli.buckets.map(BucketWidth::from) {
        let source = cli.source.unwrap_or_else(|| config.default_source.clone());
        let key = SeriesKey::new(source, cli.ticker);
        orchestrator.aggregator().rebuild(&key).await;
        let buckets = orchestrator.aggregator().buckets_over(&key, width, response.requested).await;
        println!("{}", serde_json::to_string_pretty(&buckets)?);
    }

    Ok(())
}
