//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{CoordinatorConfig, DEFAULT_BRANCH_TIMEOUT, DEFAULT_LOCK_WAIT, RetryPolicy};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL stores when set, in-memory stores otherwise
/// - `BRANCH_TIMEOUT_MS`: branch call timeout (default: `30000`)
/// - `RETRY_MAX_ATTEMPTS`: commit/rollback attempts per branch (default: `5`)
/// - `RETRY_INITIAL_BACKOFF_MS`: first retry delay, doubled per attempt (default: `100`)
/// - `LOCK_WAIT_MS`: how long a branch waits for a row held by another transaction (default: `300`)
/// - `FENCE_RETENTION_SECS`: how long rollback fences are kept (default: `86400`)
/// - `FENCE_PURGE_INTERVAL_SECS`: how often expired fences are purged (default: `3600`)
/// - `STORAGE_SERVICE_URL`, `ACCOUNT_SERVICE_URL`: call that participant over HTTP instead of in-process
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub branch_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub lock_wait: Duration,
    pub fence_retention: Duration,
    pub fence_purge_interval: Duration,
    pub storage_service_url: Option<String>,
    pub account_service_url: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |name: &str, default: Duration| {
            parsed(name).map(Duration::from_millis).unwrap_or(default)
        };
        let secs = |name: &str, default: Duration| {
            parsed(name)
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: non_empty("DATABASE_URL"),
            branch_timeout: millis("BRANCH_TIMEOUT_MS", defaults.branch_timeout),
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retry_max_attempts),
            retry_initial_backoff: millis("RETRY_INITIAL_BACKOFF_MS", defaults.retry_initial_backoff),
            lock_wait: millis("LOCK_WAIT_MS", defaults.lock_wait),
            fence_retention: secs("FENCE_RETENTION_SECS", defaults.fence_retention),
            fence_purge_interval: secs("FENCE_PURGE_INTERVAL_SECS", defaults.fence_purge_interval),
            storage_service_url: non_empty("STORAGE_SERVICE_URL"),
            account_service_url: non_empty("ACCOUNT_SERVICE_URL"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Coordinator settings derived from this configuration.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            branch_timeout: self.branch_timeout,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: self.retry_initial_backoff,
                ..RetryPolicy::default()
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            branch_timeout: DEFAULT_BRANCH_TIMEOUT,
            retry_max_attempts: retry.max_attempts,
            retry_initial_backoff: retry.initial_backoff,
            lock_wait: DEFAULT_LOCK_WAIT,
            fence_retention: Duration::from_secs(24 * 60 * 60),
            fence_purge_interval: Duration::from_secs(60 * 60),
            storage_service_url: None,
            account_service_url: None,
        }
    }
}
