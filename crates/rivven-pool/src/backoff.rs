//! Failure backoff for the grow loop
//!
//! After an open failure the grow loop waits out a backoff window before it
//! asks the factory again. The window starts at `backoff_period` and grows by
//! `backoff_multiplier` with every consecutive failure, up to `backoff_limit`.
//! A successful open clears it.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::PoolConfig;

/// Backoff state, owned by the grow loop
#[derive(Debug, Clone)]
pub struct Backoff {
    period: Duration,
    multiplier: f64,
    limit: Duration,
    current: Duration,
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

impl Backoff {
    /// Create an idle backoff from the pool configuration
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            period: config.effective_backoff_period(),
            multiplier: config.backoff_multiplier,
            limit: config.backoff_limit,
            current: Duration::ZERO,
            last_failure: None,
            last_error: None,
        }
    }

    /// Record an open failure and widen the window. Returns the new window.
    pub fn record_failure(&mut self, error: impl ToString) -> Duration {
        self.current = self.next_period();
        self.last_failure = Some(Instant::now());
        self.last_error = Some(error.to_string());
        self.current
    }

    /// Clear the window after a successful open
    pub fn record_success(&mut self) {
        self.current = Duration::ZERO;
        self.last_failure = None;
        self.last_error = None;
    }

    /// Time left in the current window, if any
    pub fn remaining(&self) -> Option<Duration> {
        let failed_at = self.last_failure?;
        let remaining = self.current.saturating_sub(failed_at.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Current window length (zero when no failure is outstanding)
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Message of the failure that opened the current window
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `max(period, previous * multiplier)`, clamped to the limit when one is set
    fn next_period(&self) -> Duration {
        let nanos = self.current.as_nanos() as f64 * self.multiplier;
        let scaled = if nanos >= u64::MAX as f64 {
            Duration::MAX
        } else {
            Duration::from_nanos(nanos as u64)
        };
        let next = scaled.max(self.period);
        if self.limit.is_zero() {
            next
        } else {
            next.min(self.limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(period_ms: u64, multiplier: f64, limit_ms: u64) -> Backoff {
        Backoff::new(
            &PoolConfig::new()
                .with_backoff_period(Duration::from_millis(period_ms))
                .with_backoff_multiplier(multiplier)
                .with_backoff_limit(Duration::from_millis(limit_ms)),
        )
    }

    #[test]
    fn test_exponential_growth_with_limit() {
        let mut backoff = backoff(100, 2.0, 500);
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(100));
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(200));
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(400));
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(500));
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(500));
    }

    #[test]
    fn test_multiplier_below_one_keeps_period() {
        let mut backoff = backoff(100, 0.5, 0);
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(100));
        assert_eq!(backoff.record_failure("e"), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_limit_means_unbounded() {
        let mut backoff = backoff(1000, 10.0, 0);
        backoff.record_failure("e");
        assert_eq!(backoff.record_failure("e"), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_period_never_spins() {
        let mut backoff = backoff(0, 1.0, 0);
        assert_eq!(backoff.record_failure("e"), Duration::from_secs(1));
        assert!(backoff.remaining().is_some());
    }

    #[test]
    fn test_success_clears_window() {
        let mut backoff = backoff(10_000, 1.0, 0);
        backoff.record_failure("refused");
        assert_eq!(backoff.last_error(), Some("refused"));
        assert!(backoff.remaining().is_some());

        backoff.record_success();
        assert_eq!(backoff.current(), Duration::ZERO);
        assert!(backoff.remaining().is_none());
        assert!(backoff.last_error().is_none());
    }
}
