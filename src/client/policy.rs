//! Request timeout and retry policies for API connections.

use crate::PatchflowError;
use std::time::Duration;

/// Computes the timeout of a request attempt.
pub trait RequestTimeoutCalculator: Send + Sync {
    /// Timeout for attempt number `attempt` (starting at 1).
    fn timeout(&self, attempt: u32) -> Duration;
}

/// Timeout that grows linearly with each attempt, up to a cap.
#[derive(Debug, Clone, Copy)]
pub struct SimpleRequestTimeoutCalculator {
    /// Timeout of the first attempt.
    pub base: Duration,
    /// Added per subsequent attempt.
    pub step: Duration,
    /// Upper bound.
    pub max: Duration,
}

impl Default for SimpleRequestTimeoutCalculator {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            step: Duration::from_secs(10),
            max: Duration::from_secs(60),
        }
    }
}

impl RequestTimeoutCalculator for SimpleRequestTimeoutCalculator {
    fn timeout(&self, attempt: u32) -> Duration {
        let extra = self.step.saturating_mul(attempt.saturating_sub(1));
        self.base.saturating_add(extra).min(self.max)
    }
}

/// Decides whether and when a failed request is retried.
pub trait RequestRetryStrategy: Send + Sync {
    /// Delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is the number of the attempt that just failed.
    fn next_delay(&self, attempt: u32, error: &PatchflowError) -> Option<Duration>;
}

/// Whether a failure is worth another attempt at all.
///
/// Network faults and 5xx answers are transient; any other answer from the
/// service is definitive.
pub fn is_retryable(error: &PatchflowError) -> bool {
    match error {
        PatchflowError::Transport(_) => true,
        PatchflowError::RemoteResponse { status, .. } => status.is_server_error(),
        _ => false,
    }
}

/// Exponential backoff starting at `base`, doubling up to `max`.
fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Never retries. Used by the keys connection so definitive rejections
/// reach license validation immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRequestRetryStrategy;

impl RequestRetryStrategy for NoRequestRetryStrategy {
    fn next_delay(&self, _attempt: u32, _error: &PatchflowError) -> Option<Duration> {
        None
    }
}

/// Retries transient failures forever with capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct InfiniteRequestRetryStrategy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Longest delay between attempts.
    pub max_delay: Duration,
}

impl Default for InfiniteRequestRetryStrategy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RequestRetryStrategy for InfiniteRequestRetryStrategy {
    fn next_delay(&self, attempt: u32, error: &PatchflowError) -> Option<Duration> {
        is_retryable(error).then(|| backoff(self.base_delay, self.max_delay, attempt))
    }
}

/// Retries transient failures up to `max_attempts` total attempts.
#[derive(Debug, Clone, Copy)]
pub struct LimitedRequestRetryStrategy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Longest delay between attempts.
    pub max_delay: Duration,
}

impl RequestRetryStrategy for LimitedRequestRetryStrategy {
    fn next_delay(&self, attempt: u32, error: &PatchflowError) -> Option<Duration> {
        if attempt >= self.max_attempts || !is_retryable(error) {
            return None;
        }
        Some(backoff(self.base_delay, self.max_delay, attempt))
    }
}
