//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

/// Dispatch loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name within the consumer group; also the ledger lease owner
    pub consumer_name: String,
    /// Maximum messages pulled per receive
    pub batch_size: usize,
    /// Maximum messages handled concurrently
    pub max_concurrent_messages: usize,
    /// Deliveries per message before it is dead-lettered
    pub max_retries: u32,
    /// Idle time after which another consumer may claim a delivery
    pub visibility_timeout: Duration,
    /// Wall-clock ceiling for a single handler invocation
    pub invocation_timeout: Duration,
    /// Sleep between empty receives
    pub poll_interval: Duration,
    /// How often to scan for stale deliveries
    pub claim_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Redelivery delay for sequence gaps and in-progress reservations
    pub defer_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            batch_size: 10,
            max_concurrent_messages: 8,
            max_retries: 5,
            visibility_timeout: Duration::from_secs(300),
            invocation_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_millis(500),
            claim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            defer_delay: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            consumer_name: std::env::var("WORKER_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            batch_size: env_parse("WORKER_BATCH_SIZE").unwrap_or(defaults.batch_size),
            max_concurrent_messages: env_parse("WORKER_MAX_CONCURRENT")
                .unwrap_or(defaults.max_concurrent_messages),
            max_retries: env_parse("WORKER_MAX_RETRIES").unwrap_or(defaults.max_retries),
            visibility_timeout: env_secs("WORKER_VISIBILITY_TIMEOUT_SECS")
                .unwrap_or(defaults.visibility_timeout),
            invocation_timeout: env_secs("WORKER_INVOCATION_TIMEOUT_SECS")
                .unwrap_or(defaults.invocation_timeout),
            poll_interval: env_millis("WORKER_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            claim_interval: env_secs("WORKER_CLAIM_INTERVAL_SECS").unwrap_or(defaults.claim_interval),
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT").unwrap_or(defaults.shutdown_timeout),
            retry_base_delay: env_millis("WORKER_RETRY_BASE_MS").unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_millis("WORKER_RETRY_MAX_MS").unwrap_or(defaults.retry_max_delay),
            defer_delay: env_millis("WORKER_DEFER_DELAY_MS").unwrap_or(defaults.defer_delay),
        }
    }

    /// Longest window in which a message can be redelivered.
    pub fn redelivery_window(&self) -> Duration {
        self.visibility_timeout.saturating_mul(self.max_retries.max(1))
    }

    /// Warn when ledger entries could expire while their message is still
    /// being redelivered. Returns true when the retention is long enough.
    pub fn check_ledger_retention(&self, ledger_retention: Duration) -> bool {
        let window = self.redelivery_window();
        if ledger_retention < window {
            warn!(
                ledger_retention_secs = ledger_retention.as_secs(),
                redelivery_window_secs = window.as_secs(),
                "Ledger retention is shorter than the redelivery window; late replays may repeat side effects"
            );
            return false;
        }
        true
    }
}

/// Orchestrator engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts per step before it fails terminally
    pub step_max_attempts: u32,
    /// Wall-clock ceiling for one step attempt
    pub step_timeout: Duration,
    pub step_base_delay: Duration,
    pub step_max_delay: Duration,
    /// Step outputs above this size are stored as blob pointers
    pub max_output_bytes: usize,
    /// Instance run lock TTL, refreshed between steps and at checkpoints
    pub lock_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_max_attempts: 3,
            step_timeout: Duration::from_secs(600),
            step_base_delay: Duration::from_millis(200),
            step_max_delay: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
            lock_ttl: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            step_max_attempts: env_parse("ENGINE_STEP_MAX_ATTEMPTS").unwrap_or(defaults.step_max_attempts),
            step_timeout: env_secs("ENGINE_STEP_TIMEOUT_SECS").unwrap_or(defaults.step_timeout),
            step_base_delay: env_millis("ENGINE_STEP_BASE_DELAY_MS").unwrap_or(defaults.step_base_delay),
            step_max_delay: env_millis("ENGINE_STEP_MAX_DELAY_MS").unwrap_or(defaults.step_max_delay),
            max_output_bytes: env_parse("ENGINE_MAX_OUTPUT_BYTES").unwrap_or(defaults.max_output_bytes),
            lock_ttl: env_secs("ENGINE_LOCK_TTL_SECS").unwrap_or(defaults.lock_ttl),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_millis)
}
