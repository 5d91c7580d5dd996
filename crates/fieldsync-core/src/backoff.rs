//! Backoff policies shared by the gateway retry loop and the channel
//! reconnect loop.
//!
//! A policy maps an attempt number (0-based) to a delay. Closures of shape
//! `Fn(u32) -> Duration` are policies too, which keeps tests short.

use std::time::Duration;

/// Delay before retry `attempt` (0-based).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl ExponentialPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        ExponentialPolicy { base, cap }
    }
}

impl Default for ExponentialPolicy {
    /// 1 s doubling up to 30 s.
    fn default() -> Self {
        ExponentialPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy for ExponentialPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        // 2^31 * any non-trivial base already exceeds every sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_then_caps() {
        let policy =
            ExponentialPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));

        let delays: Vec<_> = (0..6).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_exponential_large_attempt_does_not_overflow() {
        let policy = ExponentialPolicy::default();
        assert_eq!(policy.delay(500), Duration::from_secs(30));
    }

    #[test]
    fn test_closure_is_a_policy() {
        let fixed = |_attempt: u32| Duration::from_millis(5);
        let policy: &dyn BackoffPolicy = &fixed;
        assert_eq!(policy.delay(9), Duration::from_millis(5));
    }
}
