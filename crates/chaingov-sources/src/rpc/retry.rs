//! Exponential backoff for transient transport failures.

use chaingov_core::config::RetrySettings;
use std::time::Duration;

/// Computes the delay before each retry; stateless.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before the `attempt`-th retry (1-based), doubling and capped.
    /// `None` once `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.initial_backoff.saturating_mul(factor);
        Some(delay.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_delays() {
        let policy = RetryPolicy::new(&RetrySettings {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(&RetrySettings {
            max_retries: 40,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        });
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(40), Some(Duration::from_millis(500)));
    }
}
