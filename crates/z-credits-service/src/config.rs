//! Ledger configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use z_credits_store::StoreOptions;

use crate::retry::RetryPolicy;

/// How a negative net charge (credit owed to the user) is paid back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DowngradeCreditMode {
    /// Grant the owed amount as ledger credits, 1 credit per cent.
    #[default]
    Ledger,
    /// Issue the owed amount through the payment gateway.
    Payment,
}

impl FromStr for DowngradeCreditMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ledger" => Ok(Self::Ledger),
            "payment" => Ok(Self::Payment),
            other => Err(format!("unknown downgrade credit mode: {other}")),
        }
    }
}

/// Ledger configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Path to `RocksDB` data directory (default: "/data/z-credits").
    pub data_dir: String,

    /// Attempts per unit of work before giving up on contention.
    pub retry_max_attempts: u32,

    /// First backoff between attempts, in milliseconds.
    pub retry_initial_backoff_ms: u64,

    /// Backoff cap, in milliseconds.
    pub retry_max_backoff_ms: u64,

    /// Row lock wait before a unit of work fails with a conflict.
    pub lock_timeout_ms: i64,

    /// Bound on every external settlement or subscription call, in seconds.
    pub settlement_timeout_seconds: u64,

    /// How credits owed on a downgrade are paid back.
    pub downgrade_credit_mode: DowngradeCreditMode,

    /// Period of the scheduled reconciliation job, in seconds.
    pub reconcile_interval_seconds: u64,

    /// Stripe API key (optional).
    pub stripe_api_key: Option<String>,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    api_key: String,
}

impl LedgerConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let downgrade_credit_mode = match std::env::var("DOWNGRADE_CREDIT_MODE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "Falling back to ledger downgrade credits");
                DowngradeCreditMode::Ledger
            }),
            Err(_) => defaults.downgrade_credit_mode,
        };

        Self {
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry_max_attempts),
            retry_initial_backoff_ms: env_parse("RETRY_INITIAL_BACKOFF_MS")
                .unwrap_or(defaults.retry_initial_backoff_ms),
            retry_max_backoff_ms: env_parse("RETRY_MAX_BACKOFF_MS")
                .unwrap_or(defaults.retry_max_backoff_ms),
            lock_timeout_ms: env_parse("LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout_ms),
            settlement_timeout_seconds: env_parse("SETTLEMENT_TIMEOUT_SECONDS")
                .unwrap_or(defaults.settlement_timeout_seconds),
            downgrade_credit_mode,
            reconcile_interval_seconds: env_parse("RECONCILE_INTERVAL_SECONDS")
                .unwrap_or(defaults.reconcile_interval_seconds),
            stripe_api_key: load_stripe_api_key(),
        }
    }

    /// Retry policy for units of work.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }

    /// Options for opening the store.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout_ms: self.lock_timeout_ms,
        }
    }

    /// Bound on external calls.
    #[must_use]
    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_seconds)
    }

    /// Period of the scheduled reconciliation job.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds.max(1))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/z-credits".into(),
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 20,
            retry_max_backoff_ms: 1000,
            lock_timeout_ms: 1000,
            settlement_timeout_seconds: 15,
            downgrade_credit_mode: DowngradeCreditMode::Ledger,
            reconcile_interval_seconds: 3600,
            stripe_api_key: None,
        }
    }
}

/// Parse an environment variable, ignoring it when absent or malformed.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Load the Stripe API key from file or environment.
fn load_stripe_api_key() -> Option<String> {
    let secret_paths = [
        ".secrets/stripe.json",
        "z-credits/.secrets/stripe.json",
        "../.secrets/stripe.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return Some(secrets.api_key);
        }
    }

    tracing::debug!("Stripe secrets file not found, using environment variables");
    std::env::var("STRIPE_API_KEY").ok()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
