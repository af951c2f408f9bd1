//! Bounded, cancellable retry schedules for the polling loops.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RolloutError};

/// Capped doubling backoff, bounded by attempts and/or a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            policy: *self,
            attempt: 0,
            next_delay: self.initial,
            started: Instant::now(),
        }
    }
}

/// Running state of one poll loop.
#[derive(Debug)]
pub struct Schedule {
    policy: RetryPolicy,
    attempt: u32,
    next_delay: Duration,
    started: Instant,
}

impl Schedule {
    /// Count one attempt. Returns false once the attempt budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return false;
            }
        }
        if self.attempt > 0 && self.deadline_passed() {
            return false;
        }
        self.attempt += 1;
        true
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn deadline_passed(&self) -> bool {
        self.policy
            .deadline
            .is_some_and(|deadline| self.started.elapsed() >= deadline)
    }

    /// Delay before the next attempt, clipped to the remaining deadline.
    /// `None` when no further attempt is allowed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let mut delay = self.next_delay;
        if let Some(deadline) = self.policy.deadline {
            let remaining = deadline.saturating_sub(self.started.elapsed());
            if remaining.is_zero() {
                return None;
            }
            delay = delay.min(remaining);
        }
        self.next_delay = (self.next_delay * 2).min(self.policy.max);
        Some(delay)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RolloutError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
