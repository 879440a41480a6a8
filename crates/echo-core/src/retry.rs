//! Bounded exponential backoff shared by storage sync and the statistics client.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Base backoff duration for retries.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Maximum backoff duration.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Default maximum attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What the caller wants done with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Retry after the policy's backoff, or after `after` when the remote
    /// asked for a longer pause.
    Retry { after: Option<Duration> },
    /// Permanent failure: surface immediately.
    GiveUp,
}

/// Why a retried operation did not produce a value.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was classified as permanent.
    Fatal(E),
    /// Every allowed attempt failed.
    Exhausted { last: E, attempts: u32 },
    /// The next backoff would have crossed the caller's deadline.
    Deadline { last: E, attempts: u32 },
}

impl<E> RetryFailure<E> {
    pub fn into_last(self) -> E {
        match self {
            RetryFailure::Fatal(e) => e,
            RetryFailure::Exhausted { last, .. } => last,
            RetryFailure::Deadline { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without sleeping. Used by tests and by callers
    /// whose remote already paces itself.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Backoff to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(30) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds, the classifier gives up, attempts run out,
    /// or the next pause would pass `deadline`. `op` receives the 1-based
    /// attempt number.
    pub fn run<T, E, F, C>(
        &self,
        label: &str,
        deadline: Option<Instant>,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> RetryDecision,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let hinted = match classify(&err) {
                RetryDecision::GiveUp => return Err(RetryFailure::Fatal(err)),
                RetryDecision::Retry { after } => after,
            };
            if attempt >= max_attempts {
                return Err(RetryFailure::Exhausted {
                    last: err,
                    attempts: attempt,
                });
            }
            let backoff = self.delay_for(attempt);
            let pause = hinted.map_or(backoff, |h| h.max(backoff));
            if let Some(deadline) = deadline {
                if Instant::now() + pause >= deadline {
                    return Err(RetryFailure::Deadline {
                        last: err,
                        attempts: attempt,
                    });
                }
            }
            debug!(
                "{label}: attempt {attempt}/{max_attempts} failed ({err}); retrying in {}ms",
                pause.as_millis()
            );
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
    }
}
