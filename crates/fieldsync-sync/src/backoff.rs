//! Adapts a [`BackoffPolicy`] to the `backoff` crate's iterator-style
//! [`Backoff`] trait, with an optional attempt bound.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use fieldsync_core::BackoffPolicy;

/// Per-operation retry schedule. `next_backoff()` yields `None` once the
/// bound is reached.
pub struct PolicyBackoff {
    policy: Arc<dyn BackoffPolicy>,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl PolicyBackoff {
    pub fn new(policy: Arc<dyn BackoffPolicy>) -> Self {
        PolicyBackoff {
            policy,
            attempt: 0,
            max_attempts: None,
        }
    }

    /// `0` keeps the schedule unbounded.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = (max > 0).then_some(max);
        self
    }

    /// Hands out at most `max` delays; `0` means none at all.
    pub fn with_retry_limit(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for PolicyBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}
