//! Connection health tracking and flush-interval backoff.
//!
//! Counts consecutive sink failures and turns that count into the next
//! flush interval, plus two escalating load-shedding flags. Pure state: the
//! flush cycle is the only writer.

use std::time::Duration;

/// Consecutive failures after which the staged batch is discarded.
pub const FAILURES_BEFORE_DROPPING_BATCH: u32 = 8;

/// Consecutive failures after which the whole backlog is discarded.
pub const FAILURES_BEFORE_DROPPING_QUEUE: u32 = 10;

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    period: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
}

impl BackoffPolicy {
    pub fn new(period: Duration, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            period,
            min_backoff,
            max_backoff,
            consecutive_failures: 0,
        }
    }

    /// Policy with the default 5s floor and 10m ceiling.
    pub fn with_period(period: Duration) -> Self {
        Self::new(period, DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }

    pub fn mark_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn mark_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Interval until the next flush attempt.
    ///
    /// A single failure retries at the nominal period. From the second
    /// consecutive failure on, `max(period, min_backoff)` doubles per failure,
    /// capped at `max_backoff` and never faster than `period`.
    pub fn next_interval(&self) -> Duration {
        if self.consecutive_failures <= 1 {
            return self.period;
        }

        let exponent = self.consecutive_failures - 1;
        let base = self.period.max(self.min_backoff);
        let raw = 2u32
            .checked_pow(exponent)
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        let capped = self.max_backoff.min(raw);
        self.period.max(capped)
    }

    pub fn should_drop_batch(&self) -> bool {
        self.consecutive_failures >= FAILURES_BEFORE_DROPPING_BATCH
    }

    pub fn should_drop_queue(&self) -> bool {
        self.consecutive_failures >= FAILURES_BEFORE_DROPPING_QUEUE
    }
}
