//! Shared guardrails for analysis parameters and cache sizes.

#[cfg(feature = "python")]
use pyo3::prelude::*;

// Analysis parameter guards
pub const MAX_NEAREST_K: i64 = 100;
pub const DEFAULT_NEAREST_K: i64 = 5;
pub const MAX_SEARCH_DISTANCE_M: f64 = 200_000.0;
pub const MAX_SELECTED_FEATURES: i64 = 5000;
pub const DEFAULT_SELECTED_FEATURES: i64 = 500;
pub const MAX_SIMPLIFY_TOLERANCE_M: f64 = 1000.0;
pub const MAX_REQUEST_VARIABLES: usize = 50;
pub const MAX_REQUEST_LAYERS: usize = 8;

// Cache and retry guards
pub const MAX_RESULT_CACHE_ENTRIES: i64 = 10_000;
pub const DEFAULT_RESULT_CACHE_ENTRIES: i64 = 256;
pub const DEFAULT_RESULT_CACHE_TTL_SECS: i64 = 3600;
pub const MAX_FETCH_ATTEMPTS: i64 = 10;
pub const MAX_STATS_CACHE_ENTRIES: i64 = 100_000;

#[cfg_attr(feature = "python", pyfunction)]
pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn clamp_limit(value: i64, maximum: i64) -> i64 {
    clamp_int(value, 1, maximum)
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn clamp_distance(value: f64, maximum: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.max(0.0).min(maximum)
}

#[cfg_attr(feature = "python", pyfunction)]
pub fn clamp_cache_entries(value: i64) -> i64 {
    clamp_int(value, 1, MAX_RESULT_CACHE_ENTRIES)
}
