//! Statistical data service access.
//!
//! The transport to the statistical service lives outside this crate; it is
//! plugged in through [`StatisticalService`]. [`StatisticalDataClient`] adds
//! batching, retries and response caching on top.

pub mod client;

use std::time::Duration;

pub use client::StatisticalDataClient;

/// One call's worth of work: a set of variables for at most
/// `max_keys_per_call` geography keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub variables: Vec<String>,
    pub keys: Vec<String>,
    pub vintage: String,
}

/// Values for one key, aligned with [`BatchRequest::variables`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub key: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unknown variable `{0}`")]
    InvalidVariable(String),

    #[error("transient service failure: {0}")]
    Transient(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

pub trait StatisticalService: Send + Sync {
    /// Largest number of geography keys accepted by one call.
    fn max_keys_per_call(&self) -> usize;

    fn fetch_batch(&self, request: &BatchRequest) -> Result<Vec<BatchRow>, ServiceError>;
}
