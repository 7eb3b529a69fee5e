mod cli;
mod config;
mod core;
mod db;
mod dedup;
mod discovery;
mod error;
mod gaming;
mod ingress;
mod oracle;
mod reputation;
mod signals;
mod verifier;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, QueryCommand};
use crate::config::Config;
use crate::core::pipeline::{run_pipeline, Adjudicator};
use crate::db::SharedDatabase;
use crate::oracle::OracleRegistry;

const CONFIG_ENV: &str = "PATTERN_VALIDATOR_CONFIG";

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = match "pattern_validator=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".into());
    let config = Config::load(&config_path);
    tracing::debug!("Config: {:?}", config);

    let result = match cli.command {
        Some(Command::Query { query }) => query_store(&config, &query),
        Some(Command::Run) | None => {
            tracing::info!("pattern-validator starting...");
            run(config).await
        }
    };
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn query_store(config: &Config, query: &QueryCommand) -> Result<(), Box<dyn std::error::Error>> {
    let db = SharedDatabase::open(Path::new(&config.database.path))?;
    let answer = cli::run_query(&db, query)?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Open pattern store
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SharedDatabase::open(db_path)?;
    tracing::info!("Pattern store opened at {}", config.database.path);

    let oracles = OracleRegistry::from_config(&config.oracle)?;
    if oracles.chains().is_empty() {
        tracing::warn!("No oracle backends configured, every pattern will fail verification");
    }

    let adjudicator = Arc::new(Adjudicator::new(&config, oracles));
    let reputations = db.load_reputations()?;
    tracing::info!("Restored {} miner reputations", reputations.len());
    adjudicator.reputation().restore(reputations);

    let (store, writer) = db::spawn_writer(db.clone(), &config.database);

    // Ingress → Pipeline channel
    let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress.queue_capacity.max(1));
    let _reader = match &config.ingress.source {
        Some(path) => {
            tracing::info!("Replaying responses from {path}");
            ingress::start_reader(std::fs::File::open(path)?, ingress_tx)
        }
        None => ingress::start_reader(std::io::stdin(), ingress_tx),
    };

    let prune_interval = Duration::from_secs(config.validator.prune_interval_secs.max(1));
    let stats = run_pipeline(ingress_rx, Arc::clone(&adjudicator), store, prune_interval).await;

    // Dropping the last store handle lets the writer drain and exit.
    let written = writer.await?;
    tracing::info!(
        "Stored {} patterns and {} reputation updates ({} failed batches)",
        written.patterns_written,
        written.reputations_written,
        written.failed_batches
    );

    for (miner, entry) in adjudicator.gaming().watchlist() {
        tracing::warn!(miner = %miner, strikes = entry.strikes, "Miner on coordination watchlist");
    }
    if let Ok(summary) = db.get_statistics() {
        tracing::info!(
            "Store totals: {} patterns, {} duplicates, average score {:.3}",
            summary.total,
            summary.duplicates,
            summary.average_score
        );
    }
    tracing::info!("Adjudicated {} patterns, shutting down", stats.adjudicated);
    Ok(())
}
