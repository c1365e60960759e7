//! Retry policy for partition builds.
//!
//! ```text
//! ├─→ Attempt 1: Immediate
//! ├─→ Attempt 2: Wait 100ms (backoff)
//! ├─→ Attempt 3: Wait 200ms (backoff * 2)
//! └─→ ...        capped at max_backoff
//! ```
//!
//! Only errors classified transient by [`PrismError::is_transient`] are
//! retried; everything else fails the job on the first attempt.

use std::time::Duration;

use prism_core::{ExternalQueueOptions, PrismError};

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per job, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&ExternalQueueOptions::default())
    }
}

impl RetryPolicy {
    pub fn from_options(options: &ExternalQueueOptions) -> Self {
        Self {
            max_attempts: options.max_attempts.max(1),
            initial_backoff: Duration::from_millis(options.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(options.retry_max_backoff_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    ///
    /// `min(initial_backoff * multiplier^retry, max_backoff)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64)
    }

    /// Whether a failure on attempt `attempt` (1-indexed) should be retried.
    pub fn should_retry(&self, error: &PrismError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{SecurityError, SourceError};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = RetryPolicy::default();
        let timeout = PrismError::Source(SourceError::Timeout {
            data_source: "default".to_string(),
            timeout_ms: 10,
        });
        let rejected = PrismError::Security(SecurityError::QueryRejected {
            reason: "no".to_string(),
        });
        assert!(policy.should_retry(&timeout, 1));
        assert!(policy.should_retry(&timeout, 2));
        assert!(!policy.should_retry(&timeout, 3));
        assert!(!policy.should_retry(&rejected, 1));
        assert!(!RetryPolicy::no_retry().should_retry(&timeout, 1));
    }
}
