//! Z-Credits reconciler - scheduled balance drift correction.
//!
//! Opens the ledger store and reconciles every user on a fixed interval until
//! interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_credits_service::{LedgerConfig, Reconciler};
use z_credits_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_credits_service=debug,z_credits_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Credits reconciler");

    // Load configuration from environment
    let config = LedgerConfig::from_env();

    tracing::info!(
        data_dir = %config.data_dir,
        interval_seconds = config.reconcile_interval_seconds,
        retry_max_attempts = config.retry_max_attempts,
        lock_timeout_ms = config.lock_timeout_ms,
        "Reconciler configuration loaded"
    );

    // Initialize RocksDB store
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir, &config.store_options())?);

    let reconciler = Reconciler::new(store, config.retry_policy());
    let mut ticker = tokio::time::interval(config.reconcile_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reconciler.reconcile_all().await {
                    Ok(summary) if !summary.overdrawn.is_empty() => {
                        tracing::warn!(
                            overdrawn = ?summary.overdrawn,
                            "Users with negative balances after reconciliation"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested, stopping reconciler");
                break;
            }
        }
    }

    Ok(())
}
