//! Retry decision and exponential backoff for step execution.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. The attempt counter itself is persisted on the step row,
//! so a resumed run keeps counting where it left off.

use std::time::Duration;

use keel_types::config::RetryPolicy;

use super::handler::HandlerError;

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow `error`.
    ///
    /// `attempts_in_window` counts the attempts already made in the current
    /// retry window (1 after the first failure). Permanent errors never retry.
    pub fn should_retry(policy: &RetryPolicy, error: &HandlerError, attempts_in_window: u32) -> bool {
        error.is_transient() && attempts_in_window < policy.max_attempts
    }

    /// Whether a step may start another attempt in the current window.
    pub fn has_budget(policy: &RetryPolicy, attempts_in_window: u32) -> bool {
        attempts_in_window < policy.max_attempts
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) just failed.
    ///
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = policy
            .base_delay_ms
            .saturating_mul(factor)
            .min(policy.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, 100, 1_000)
    }

    #[test]
    fn test_should_retry_within_limit() {
        let err = HandlerError::transient("timeout");
        assert!(RetryHandler::should_retry(&policy(), &err, 1));
        assert!(RetryHandler::should_retry(&policy(), &err, 2));
    }

    #[test]
    fn test_should_not_retry_at_max() {
        let err = HandlerError::transient("timeout");
        assert!(!RetryHandler::should_retry(&policy(), &err, 3));
        assert!(!RetryHandler::should_retry(&policy(), &err, 4));
    }

    #[test]
    fn test_permanent_never_retries() {
        let err = HandlerError::permanent("bad input");
        assert!(!RetryHandler::should_retry(&policy(), &err, 1));
    }

    #[test]
    fn test_single_attempt_policy() {
        let single = RetryPolicy::new(1, 100, 1_000);
        assert!(RetryHandler::has_budget(&single, 0));
        assert!(!RetryHandler::has_budget(&single, 1));
        assert!(!RetryHandler::should_retry(&single, &HandlerError::transient("x"), 1));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(RetryHandler::backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(RetryHandler::backoff_delay(&p, 4), Duration::from_millis(800));
        assert_eq!(RetryHandler::backoff_delay(&p, 5), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_never_overflows() {
        let p = RetryPolicy::new(100, u64::MAX / 2, u64::MAX);
        assert_eq!(RetryHandler::backoff_delay(&p, 90), Duration::from_millis(u64::MAX));
    }
}
