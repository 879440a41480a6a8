//! Echo core library: catalog-driven geospatial analysis engine.
//!
//! A versioned dataset catalog describes spatial layers and attribute
//! tables. Datasets are fetched on demand into a local store, joined against
//! a request geometry, and aggregated by pluggable analysis executors whose
//! results are memoized per request fingerprint. With the `python` feature
//! the crate builds as the `_echo_core` extension module.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod guards;
pub mod models;
pub mod observability;
pub mod retry;
pub mod singleflight;
pub mod spatial;
pub mod stats;
pub mod store;

#[cfg(feature = "python")]
mod python;

pub use engine::AnalysisEngine;
pub use errors::{EchoError, EchoResult};

#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::wrap_pyfunction;

// ---------------------------------------------------------------------------
// Top-level Python module: _echo_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _echo_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let format = config::EngineConfig::from_env()
        .map(|c| c.log_format)
        .unwrap_or_default();
    observability::init_logging(format);

    m.add_class::<python::PyAnalysisEngine>()?;

    // -- Guards (constants + clamping functions) -----------------------------
    m.add("MAX_NEAREST_K", guards::MAX_NEAREST_K)?;
    m.add("DEFAULT_NEAREST_K", guards::DEFAULT_NEAREST_K)?;
    m.add("MAX_SEARCH_DISTANCE_M", guards::MAX_SEARCH_DISTANCE_M)?;
    m.add("MAX_SELECTED_FEATURES", guards::MAX_SELECTED_FEATURES)?;
    m.add("MAX_SIMPLIFY_TOLERANCE_M", guards::MAX_SIMPLIFY_TOLERANCE_M)?;
    m.add("MAX_REQUEST_VARIABLES", guards::MAX_REQUEST_VARIABLES)?;
    m.add("MAX_REQUEST_LAYERS", guards::MAX_REQUEST_LAYERS)?;
    m.add("MAX_RESULT_CACHE_ENTRIES", guards::MAX_RESULT_CACHE_ENTRIES)?;

    m.add_function(wrap_pyfunction!(guards::clamp_int, m)?)?;
    m.add_function(wrap_pyfunction!(guards::clamp_limit, m)?)?;
    m.add_function(wrap_pyfunction!(guards::clamp_distance, m)?)?;
    m.add_function(wrap_pyfunction!(guards::clamp_cache_entries, m)?)?;

    Ok(())
}
