use std::time::Duration;

/// Decides whether (and when) a dropped or failed connection is retried.
pub trait RetryStrategy: Send + Sync {
    /// `failures` is the number of consecutive failed attempts so far, starting at 1.
    /// Returning `None` gives up.
    fn delay_for(&self, failures: u32) -> Option<Duration>;
}

/// Never reconnect, the caller decides when to try again
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn delay_for(&self, _failures: u32) -> Option<Duration> {
        None
    }
}

/// Exponential backoff, doubling from `initial` up to `max`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Give up after this many consecutive failures, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: Some(8),
        }
    }
}

impl RetryStrategy for Backoff {
    fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || self.max_attempts.is_some_and(|max| failures > max) {
            return None;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}
