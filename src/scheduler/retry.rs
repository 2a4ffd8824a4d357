//! Call-level retry policy.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{Backoff, ConcurrencyPolicy};
use crate::error::{ErrorKind, ProviderError};

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Whether `Timeout` errors are retried here. Subprocess generators turn
    /// this off and handle timeouts in their own outer budget.
    pub retry_timeouts: bool,
}

impl RetryPolicy {
    pub fn from_concurrency(policy: &ConcurrencyPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            delay: policy.retry_delay,
            backoff: policy.backoff,
            retry_timeouts: true,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            retry_timeouts: false,
        }
    }

    pub fn without_timeout_retries(mut self) -> Self {
        self.retry_timeouts = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 1u32 << retry.saturating_sub(1).min(16);
                self.delay.saturating_mul(factor)
            }
        };
        delay.min(MAX_BACKOFF)
    }

    /// Whether `err` on attempt `attempt` (1-based) may be retried.
    pub fn should_retry(&self, err: &ProviderError, attempt: u32) -> bool {
        if attempt > self.max_retries {
            return false;
        }
        match err.kind {
            ErrorKind::Transient => true,
            ErrorKind::Timeout => self.retry_timeouts,
            ErrorKind::Permanent | ErrorKind::Cancelled => false,
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_millis(100),
            backoff,
            retry_timeouts: true,
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(Backoff::Fixed);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(Backoff::Exponential);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(40), MAX_BACKOFF);
    }

    #[test]
    fn test_should_retry_by_kind_and_budget() {
        let p = policy(Backoff::Fixed);
        let transient = ProviderError::transient("503");
        assert!(p.should_retry(&transient, 1));
        assert!(p.should_retry(&transient, 3));
        assert!(!p.should_retry(&transient, 4));
        assert!(!p.should_retry(&ProviderError::permanent("401"), 1));
        assert!(!p.should_retry(&ProviderError::cancelled("stopped"), 1));
        assert!(p.should_retry(&ProviderError::timeout("slow"), 1));

        let sub = p.without_timeout_retries();
        assert!(!sub.should_retry(&ProviderError::timeout("slow"), 1));
        assert!(sub.should_retry(&transient, 1));
    }

    #[test]
    fn test_none_policy() {
        let p = RetryPolicy::none();
        assert_eq!(p.max_attempts(), 1);
        assert!(!p.should_retry(&ProviderError::transient("x"), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(1), &cancel).await);
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(1), &cancel).await);
        assert!(!sleep_or_cancel(Duration::ZERO, &cancel).await);
    }
}
