use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_reconcile::DEFAULT_RESYNC_INTERVAL;

use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub manifest: Option<PathBuf>,
    pub resync_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub cycle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("CADENCE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let manifest = lookup("CADENCE_MANIFEST")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let resync_interval = seconds(
            &lookup,
            "CADENCE_RESYNC_SECS",
            DEFAULT_RESYNC_INTERVAL.as_secs(),
        )?;
        let retry_base = seconds(&lookup, "CADENCE_RETRY_SECS", 5)?;
        let retry_max = seconds(&lookup, "CADENCE_MAX_RETRY_SECS", 300)?;
        let cycle_timeout = seconds(&lookup, "CADENCE_CYCLE_TIMEOUT_SECS", 30)?;

        if retry_max < retry_base {
            anyhow::bail!(
                "CADENCE_MAX_RETRY_SECS ({}) must not be below CADENCE_RETRY_SECS ({})",
                retry_max.as_secs(),
                retry_base.as_secs()
            );
        }

        Ok(Self {
            log_level,
            manifest,
            resync_interval,
            retry_base,
            retry_max,
            cycle_timeout,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            resync_interval: self.resync_interval,
            retry_base: self.retry_base,
            retry_max: self.retry_max,
            cycle_timeout: self.cycle_timeout,
        }
    }
}

/// Reads a positive number of seconds, falling back to `default`.
fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    let secs = match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be a whole number of seconds, got {raw:?}"))?,
        None => default,
    };
    if secs == 0 {
        anyhow::bail!("{name} must be positive");
    }
    Ok(Duration::from_secs(secs))
}
