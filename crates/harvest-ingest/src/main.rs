//! Harvest - users, bets, contracts and comments ingestion tool

use anyhow::Result;
use clap::Parser;
use harvest_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use harvest_ingest::store::PgStore;
use harvest_ingest::{ApiClient, HarvestConfig, Pipeline, RateLimiter, Stages};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(author, version, about = "Ingest users, bets, contracts and comments into Postgres")]
struct Cli {
    /// Only run the users stage
    #[arg(long)]
    users_only: bool,

    /// Only run the bets stage
    #[arg(long)]
    bets_only: bool,

    /// Only refresh contracts for the most active bettors
    #[arg(long)]
    contracts_only: bool,

    /// Only refresh comments for the most active bettors
    #[arg(long)]
    comments_only: bool,

    /// Resume the bets stage at this username
    #[arg(long, value_name = "USERNAME")]
    start_username: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn log_config(cli: &Cli) -> Result<LogConfig> {
    let mut config = LogConfig {
        output: LogOutput::Both,
        ..Default::default()
    }
    .merge_env()?;

    // Flags win over the environment
    if let Some(ref level) = cli.log_level {
        config.level = level.parse()?;
    }
    if cli.verbose {
        config.level = LogLevel::Debug;
    }
    Ok(config)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping at the next safe point");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let stages = Stages::from_flags(
        cli.users_only,
        cli.bets_only,
        cli.contracts_only,
        cli.comments_only,
    )?;

    let _log_guard = init_logging(&log_config(&cli)?)?;
    let config = HarvestConfig::from_env()?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let limiter = Arc::new(RateLimiter::new(config.api.min_interval()));
    let client = ApiClient::builder(&config.api.base_url)
        .api_key(config.api.api_key.clone())
        .timeout(config.api.timeout())
        .retry_policy(config.api.retry_policy())
        .rate_limiter(limiter)
        .cancellation(cancel)
        .build()?;

    let store = PgStore::connect(&config.database.url, config.database.max_connections).await?;
    store.ensure_schema().await?;

    info!(?stages, api = %config.api.base_url, "Harvest started");

    let pipeline = Pipeline::new(client, store, config.users, config.bets)
        .with_contracts(config.contracts)
        .with_comments(config.comments);
    let reports = pipeline.run(stages, cli.start_username.as_deref()).await?;

    for report in &reports {
        info!(
            stage = report.stage,
            chunks = report.chunks,
            payloads = report.payloads,
            upserted = report.rows_upserted,
            malformed = report.malformed,
            dropped = report.dropped,
            failed = report.failed,
            "Stage summary"
        );
    }

    info!("Harvest complete");
    Ok(())
}
