//! Retry strategy for dialing and declaring
//!
//! The relay has no useful degraded mode without its broker, so retries are
//! unbounded: there is no attempt limit and no circuit breaker. The policy
//! only decides how long to pause between sweeps.

use std::time::Duration;

/// Default pause between failed sweeps
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Infinite retry with a configurable pause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delays in milliseconds for the first attempts (may be empty)
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_pattern: Vec::new(),
            sustained_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Same pause after every failed attempt
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff_pattern: Vec::new(),
            sustained_delay_ms: delay.as_millis() as u64,
        }
    }

    /// Pause before retrying after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms);
        Duration::from_millis(millis)
    }

    /// Suspend for the delay of `attempt`
    ///
    /// A zero delay still yields so a retry loop cannot starve the runtime.
    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_one_second() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff_pattern.is_empty());
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_pattern_then_sustained() {
        let policy = RetryPolicy {
            backoff_pattern: vec![25, 50, 100],
            sustained_delay_ms: 250,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for(2), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(250));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn test_attempt_zero_uses_first_slot() {
        let policy = RetryPolicy {
            backoff_pattern: vec![10],
            sustained_delay_ms: 20,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_sleeps_for_delay() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        policy.pause(1).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_pause_returns_immediately() {
        let policy = RetryPolicy::fixed(Duration::ZERO);
        tokio::time::timeout(Duration::from_millis(100), policy.pause(7))
            .await
            .expect("zero backoff must not block");
    }
}
