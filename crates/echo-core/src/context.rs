//! Per-request deadline carried through an executor chain.

use std::time::{Duration, Instant};

use crate::errors::{EchoError, EchoResult};

/// Deadline for one analysis request.
///
/// Only work owned by the request observes it: statistics batches, retry
/// pauses and waits on shared work. Shared dataset fetches keep running.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`EchoError::Timeout`] once the deadline has passed.
    pub fn check(&self, activity: &str) -> EchoResult<()> {
        if self.is_expired() {
            Err(EchoError::Timeout(activity.to_string()))
        } else {
            Ok(())
        }
    }
}
