use std::time::Duration;

/// Backoff and circuit-breaker bookkeeping for a task that retries forever.
///
/// The delay doubles after every failure up to `max`. Once
/// `breaker_threshold` consecutive failures pile up the breaker is
/// considered tripped; retries continue at the capped delay and the next
/// success closes it again.
pub(crate) struct RetryState {
    backoff: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    consecutive_failures: u32,
    breaker_threshold: u32,
}

impl RetryState {
    pub(crate) fn new(initial: Duration, max: Duration, breaker_threshold: u32) -> Self {
        Self {
            backoff: initial,
            backoff_initial: initial,
            backoff_max: max,
            consecutive_failures: 0,
            breaker_threshold,
        }
    }

    /// Reset backoff and failure count. Returns `true` if this success
    /// closed a tripped breaker.
    pub(crate) fn on_success(&mut self) -> bool {
        let was_tripped = self.is_tripped();
        self.backoff = self.backoff_initial;
        self.consecutive_failures = 0;
        was_tripped
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub(crate) fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff;
        self.backoff = self.backoff.saturating_mul(2).min(self.backoff_max);
        delay
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.consecutive_failures >= self.breaker_threshold
    }

    /// `true` exactly on the failure that trips the breaker.
    pub(crate) fn just_tripped(&self) -> bool {
        self.consecutive_failures == self.breaker_threshold
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
