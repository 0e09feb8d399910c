//! When a failed outbox attempt runs again, and when the event is given up on.
//!
//! Attempts are counted by the lease, so `attempts` here is always the number
//! of attempts already made, including the one that just failed.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::outbox::ProcessingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every retry waits `base_delay`.
    Fixed,
    /// The wait doubles after each failure, starting at `base_delay`.
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// An event whose attempt count reaches this is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Wait after the `attempts`-th failure. Zero attempts means no wait.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let doublings = (attempts - 1).min(31);
                self.base_delay.checked_mul(1 << doublings).unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    /// When the next attempt becomes due, counted from the failure.
    pub fn next_attempt_at(&self, attempts: u32, failed_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_after(attempts))
            .ok()
            .and_then(|delay| failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Processing status a row takes after its `attempts`-th failure.
    pub fn status_after_failure(&self, attempts: u32) -> ProcessingStatus {
        if self.should_retry(attempts) {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Dead
        }
    }
}
