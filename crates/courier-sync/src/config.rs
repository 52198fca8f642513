//! Sync configuration loaded from environment variables.
//!
//! Every setting has a default so the core runs with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_NETWORK_TIMEOUT_MS, DEFAULT_TYPING_TTL_MS};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Database file.  `None` uses the platform data directory.
    /// Env: `COURIER_DB_PATH`
    pub database_path: Option<PathBuf>,

    /// Bound on every remote fetch and write.
    /// Env: `COURIER_NETWORK_TIMEOUT_MS`
    /// Default: 10 s
    pub network_timeout: Duration,

    /// Replay backoff.
    /// Env: `COURIER_MAX_ATTEMPTS`, `COURIER_RETRY_BASE_MS`,
    /// `COURIER_RETRY_MAX_MS`, `COURIER_RETRY_JITTER`
    pub retry: RetryPolicy,

    /// How long a typing indicator stays on without a refresh.
    /// Env: `COURIER_TYPING_TTL_MS`
    /// Default: 5 s
    pub typing_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            network_timeout: Duration::from_millis(DEFAULT_NETWORK_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("COURIER_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(ms) = parsed::<u64>(&lookup, "COURIER_NETWORK_TIMEOUT_MS") {
            config.network_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parsed::<u32>(&lookup, "COURIER_MAX_ATTEMPTS") {
            if n > 0 {
                config.retry.max_attempts = n;
            } else {
                tracing::warn!("COURIER_MAX_ATTEMPTS must be positive, using default");
            }
        }

        if let Some(ms) = parsed::<u64>(&lookup, "COURIER_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = parsed::<u64>(&lookup, "COURIER_RETRY_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(j) = parsed::<f64>(&lookup, "COURIER_RETRY_JITTER") {
            if (0.0..=1.0).contains(&j) {
                config.retry.jitter = j;
            } else {
                tracing::warn!(value = j, "COURIER_RETRY_JITTER outside 0..=1, using default");
            }
        }

        if let Some(ms) = parsed::<u64>(&lookup, "COURIER_TYPING_TTL_MS") {
            config.typing_ttl = Duration::from_millis(ms);
        }

        config
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
