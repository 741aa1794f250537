//! Exponential backoff.

use crate::config::{RetryConfig, WifiConfig};
use std::time::Duration;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed per operation; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Wait after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for any single wait
    pub max_backoff: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Bounded policy for report delivery.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: Some(config.max_attempts.max(1)),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// Unbounded doubling policy for radio association.
    pub fn for_association(config: &WifiConfig) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: 2.0,
        }
    }

    /// Wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_backoff.as_nanos() as f64;
        if nanos.is_nan() || nanos >= cap {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Whether another attempt may follow `attempt` failed ones.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Attempts per operation, saturating at `u32::MAX` for unbounded policies.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(u32::MAX)
    }

    /// The sequence of waits between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let waits = self.attempts().saturating_sub(1);
        (1..=waits).map(move |attempt| self.delay_for(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delays_grow_then_cap() {
        let delays: Vec<u64> = policy().delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);

        assert_eq!(policy().delay_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = policy();
        assert!(policy.allows_retry_after(4));
        assert!(!policy.allows_retry_after(5));
    }

    #[test]
    fn test_association_policy_never_gives_up() {
        let policy = RetryPolicy::for_association(&WifiConfig::default());
        assert!(policy.allows_retry_after(u32::MAX - 1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_exponent_does_not_overflow() {
        let policy = RetryPolicy {
            multiplier: 10.0,
            ..policy()
        };
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1000));
    }
}
