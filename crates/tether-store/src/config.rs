//! Store configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    /// Prefix for every key this crate writes
    pub key_prefix: String,
    /// How long ledger entries are kept; replays after this may repeat effects
    pub ledger_retention: Duration,
    /// How long a reservation is exclusive before another worker may take it
    pub ledger_lease: Duration,
    /// Audit entries kept per job
    pub audit_max_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "tether:".to_string(),
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
            ledger_lease: Duration::from_secs(300),
            audit_max_len: 1000,
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("STORE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            ledger_retention: env_secs("LEDGER_RETENTION_SECS").unwrap_or(defaults.ledger_retention),
            ledger_lease: env_secs("LEDGER_LEASE_SECS").unwrap_or(defaults.ledger_lease),
            audit_max_len: std::env::var("AUDIT_MAX_LEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.audit_max_len),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
