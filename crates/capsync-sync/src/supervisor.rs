use std::future::Future;
use std::time::Duration;

use capsync_core::SyncError;
use tracing::warn;

/// Bounded retry count with capped exponential delay (`base * 2^attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed beyond the first.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// What to do with a unit whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry { after: Duration },
    /// `exhausted` is true when the failure was retryable but the attempt
    /// budget ran out.
    Abandon { exhausted: bool },
}

/// Result of a supervised unit of work.
#[derive(Debug)]
pub enum Supervised<T> {
    Done {
        value: T,
        attempts: usize,
    },
    Abandoned {
        error: SyncError,
        attempts: usize,
        exhausted: bool,
    },
}

impl<T> Supervised<T> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Done { attempts, .. } | Self::Abandoned { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// `attempt` is the zero-based index of the attempt that failed.
    pub fn judge(&self, err: &SyncError, attempt: usize) -> Verdict {
        if !err.is_retryable() {
            Verdict::Abandon { exhausted: false }
        } else if attempt >= self.policy.max_retries {
            Verdict::Abandon { exhausted: true }
        } else {
            Verdict::Retry {
                after: self.policy.delay_for_attempt(attempt),
            }
        }
    }

    /// Runs `attempt_fn` until it succeeds, fails terminally, or the retry
    /// budget is spent. The callback receives the attempt index.
    pub async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> Supervised<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match attempt_fn(attempt).await {
                Ok(value) => {
                    return Supervised::Done {
                        value,
                        attempts: attempt + 1,
                    }
                }
                Err(error) => error,
            };

            match self.judge(&error, attempt) {
                Verdict::Retry { after } => {
                    warn!(
                        attempt,
                        kind = error.kind(),
                        error = %error,
                        retry_in_ms = after.as_millis() as u64,
                        "retrying"
                    );
                    tokio::time::sleep(after).await;
                    attempt += 1;
                }
                Verdict::Abandon { exhausted } => {
                    warn!(
                        attempt,
                        kind = error.kind(),
                        error = %error,
                        exhausted,
                        "abandoning unit"
                    );
                    return Supervised::Abandoned {
                        error,
                        attempts: attempt + 1,
                        exhausted,
                    };
                }
            }
        }
    }
}
