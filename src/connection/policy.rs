// src/connection/policy.rs
use backoff::backoff::{Backoff, Constant};
use std::time::Duration;

/// Fixed-delay reconnection policy with a cap on consecutive failures.
///
/// The delay never grows and carries no jitter; recovery latency stays
/// predictable for a low-traffic dashboard.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delay: Constant,
    max_attempts: u32,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay: Constant::new(delay),
            max_attempts,
            failures: 0,
        }
    }

    /// Record a failed connection attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once
    /// `max_attempts` consecutive attempts have failed.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_attempts {
            return None;
        }
        self.delay.next_backoff()
    }

    /// Delay used before reconnecting after an established connection drops.
    /// Does not count as a failure.
    pub fn retry_delay(&mut self) -> Duration {
        self.delay.next_backoff().unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay.reset();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_fixed_until_the_cap() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1000), 10);
        for attempt in 1..10 {
            assert_eq!(
                policy.record_failure(),
                Some(Duration::from_millis(1000)),
                "attempt {attempt}"
            );
        }
        assert_eq!(policy.record_failure(), None);
        assert_eq!(policy.failures(), 10);
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(50), 2);
        assert!(policy.record_failure().is_some());
        policy.reset();
        assert_eq!(policy.failures(), 0);
        assert!(policy.record_failure().is_some());
        assert!(policy.record_failure().is_none());
    }

    #[test]
    fn single_attempt_budget_fails_immediately() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(50), 1);
        assert_eq!(policy.record_failure(), None);
    }

    #[test]
    fn retry_after_drop_does_not_consume_budget() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(250), 3);
        assert_eq!(policy.retry_delay(), Duration::from_millis(250));
        assert_eq!(policy.failures(), 0);
    }
}
