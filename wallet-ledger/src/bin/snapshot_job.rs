//! Periodic snapshot job
//!
//! Opens the ledger and snapshots every wallet that crossed the threshold,
//! once per configured interval, until Ctrl-C.

use anyhow::Context;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wallet_ledger::{Config, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var_os("WALLET_LEDGER_LOG_JSON").is_some() {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("Starting wallet ledger snapshot job");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from: {}", path);
            Config::from_file(&path).with_context(|| format!("loading config from {}", path))?
        }
        None => {
            info!("Loading config from environment variables");
            Config::from_env().context("loading config from environment")?
        }
    };

    let interval_secs = config.snapshot.job_interval_secs;
    let engine = Engine::open(config).context("opening wallet ledger")?;
    info!(interval_secs, "Ledger opened");

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshots = engine.snapshots().clone();
                match tokio::task::spawn_blocking(move || snapshots.create_snapshots_for_all_wallets()).await {
                    Ok(Ok(report)) => info!(
                        examined = report.examined,
                        created = report.created,
                        failed = report.failed,
                        "Snapshot run finished"
                    ),
                    Ok(Err(e)) => error!(error = %e, "Snapshot run failed"),
                    Err(e) => error!(error = %e, "Snapshot task panicked"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("listening for shutdown signal")?;
                break;
            }
        }
    }

    info!("Shutting down snapshot job");
    Ok(())
}
