//! Backoff policy for message redelivery and step retries.
//!
//! Exponential with a cap and up to 25% jitter, so that failures from a
//! shared cause do not come back in lockstep.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay);
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.25);
        (delay + jitter).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1));

        let first = policy.delay_for_attempt(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));

        let third = policy.delay_for_attempt(3);
        assert!(third >= Duration::from_millis(400));

        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(10));
        let delays: Vec<Duration> = (0..50).map(|_| policy.delay_for_attempt(2)).collect();

        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(400) && *d <= Duration::from_millis(500)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_zero_base_means_no_delay() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(4), Duration::ZERO);
    }
}
