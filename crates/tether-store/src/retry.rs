//! Store-call retry with exponential backoff and jitter.
//!
//! Only errors classified as retryable (connection drops, timeouts) are
//! retried; conflicts and corrupt records surface immediately.

use std::time::Duration;

use tracing::{info_span, warn, Instrument};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_retry;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (in milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_u64("STORE_RETRY_MAX")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_retries),
            base_delay_ms: env_u64("STORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay_ms),
            max_delay_ms: env_u64("STORE_RETRY_MAX_MS").unwrap_or(defaults.max_delay_ms),
        }
    }

    /// No retries; used by tests that inject failures.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Execute a store operation, retrying transient backend failures.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        let span = info_span!("store_retry", operation = %operation, attempt = attempt + 1);

        match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = calculate_delay(config, attempt);

                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Store operation failed, retrying: {}",
                    e
                );

                record_retry(operation);
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| StoreError::unavailable(format!("{} exhausted retries", operation))))
}

/// Exponential backoff with full jitter, floored at the base delay.
fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp_delay = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let capped_delay = exp_delay.min(config.max_delay_ms);

    let jittered = ((capped_delay as f64) * rand::random::<f64>()) as u64;

    Duration::from_millis(jittered.max(config.base_delay_ms))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_calculate_delay_respects_max() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 2000,
        };
        let delay = calculate_delay(&config, 10);
        assert!(delay.as_millis() <= 2000);
    }

    #[test]
    fn test_calculate_delay_minimum() {
        let config = RetryConfig::default();
        let delay = calculate_delay(&config, 0);
        assert!(delay.as_millis() >= config.base_delay_ms as u128);
    }

    #[test]
    fn test_calculate_delay_is_capped() {
        let config = RetryConfig::default();
        for _ in 0..20 {
            let delay = calculate_delay(&config, 20);
            assert!(delay.as_millis() <= config.max_delay_ms.max(config.base_delay_ms) as u128);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retry(&config, "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::unavailable("flaky"))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let config = RetryConfig::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: StoreResult<()> = with_retry(&config, "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::conflict("k", "different result"))
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
