//! Rewards Ledger Daemon
//!
//! Owns the ledger database, keeps the mirror up to date and runs the
//! periodic plan-expiry / free-refill sweep.
//!
//! ## Usage
//!
//! ```bash
//! # Run the sweep loop with defaults until Ctrl-C
//! rewards-ledger
//!
//! # Custom config and data directory
//! rewards-ledger --config /etc/rewards-ledger.toml --data-dir /data/ledger run
//!
//! # One sweep, report printed as JSON
//! rewards-ledger sweep
//!
//! # Refill the primary store from the mirror after losing the database
//! rewards-ledger --mirror-dir /backup/mirror restore
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use rewards_ledger::{retry_transient, Config, FsMirror, Ledger, Replicator, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rewards-ledger")]
#[command(about = "Account ledger and entitlement engine for a rewards bot")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "REWARDS_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database, default mirror, config)
    #[arg(long, env = "REWARDS_LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Mirror directory for write-behind replication
    #[arg(long, env = "REWARDS_LEDGER_MIRROR_DIR")]
    mirror_dir: Option<PathBuf>,

    /// Seconds between expiry/refill sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the sweep loop until Ctrl-C (default)
    Run,
    /// Run one expiry/refill sweep and print the report
    Sweep,
    /// Restore users and codes missing from the database out of the mirror
    Restore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rewards_ledger=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = args.mirror_dir {
        config.mirror_dir = Some(dir);
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweep_interval_secs = secs;
    }
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    info!(
        data_dir = %config.data_dir.display(),
        mirror_dir = %config.mirror_path().display(),
        "Starting rewards-ledger"
    );

    let mirror = Arc::new(FsMirror::new(config.mirror_path()).await?);
    let (replicator, worker) = Replicator::spawn(mirror.clone(), config.replication_queue_capacity);
    let ledger = Ledger::open(&config, replicator.clone(), Arc::new(SystemClock)).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&ledger, &config).await?,
        Command::Sweep => {
            let report = ledger.run_expiry_sweep_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Restore => {
            let report = ledger.restore_from_mirror(mirror.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    ledger.flush().await?;

    // The worker exits once every handle is gone and the queue is drained
    drop(ledger);
    replicator.barrier().await;
    let stats = replicator.snapshot();
    drop(replicator);
    worker.await?;

    info!(
        written = stats.written,
        failed = stats.failed,
        dropped = stats.dropped,
        "Replication drained"
    );
    Ok(())
}

async fn run(ledger: &Ledger, config: &Config) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = config.sweep_interval_secs, "Sweep loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = retry_transient(
                    config.storage_retry_attempts,
                    Duration::from_millis(100),
                    || ledger.run_expiry_sweep_once(),
                )
                .await;
                if let Err(e) = result {
                    error!(error = %e, "Sweep failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
