// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Retry timing for connect attempts. After failed attempt `k` (counting from
//! zero) the manager waits `min(2^k, 60)` seconds before trying again. The
//! number of attempts is bounded by the configured retry count, where a
//! negative count means the budget never runs out.

use ::backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Delay before the first retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound of a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Deterministic `min(2^k, 60)` second schedule that never gives up on its
/// own; the retry count is enforced by [`RetryBudget`].
pub fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_BACKOFF)
        .with_multiplier(2.0)
        .with_max_interval(MAX_BACKOFF)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

/// Attempt counter bounded by the configured retry count, paired with the
/// backoff schedule between attempts.
pub struct RetryBudget {
    max_attempts: Option<u32>,
    attempt: u32,
    backoff: ExponentialBackoff,
}

impl RetryBudget {
    /// Creates a budget from the configured retry count; negative is unbounded.
    pub fn new(max_retry_count: i32) -> Self {
        RetryBudget {
            max_attempts: u32::try_from(max_retry_count).ok(),
            attempt: 0,
            backoff: reconnect_backoff(),
        }
    }

    /// Whether another attempt may be made.
    pub fn has_remaining(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.attempt < max,
            None => true,
        }
    }

    /// Next delay of the schedule, without spending an attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(MAX_BACKOFF)
    }

    /// Records a failed attempt and returns the delay to wait before the next
    /// one, or `None` when the budget is spent.
    pub fn fail(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);

        if self.has_remaining() {
            Some(self.next_delay())
        } else {
            None
        }
    }

    /// Number of attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
