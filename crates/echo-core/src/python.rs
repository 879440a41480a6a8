//! Python bindings for the analysis engine.
//!
//! Results cross the boundary as JSON text; the HTTP layer passes them on
//! unchanged. Remote stores and the statistical service can be supplied as
//! Python objects.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::engine::AnalysisEngine;
use crate::errors::{EchoError, EchoResult};
use crate::models::{AnalysisRequest, ParamValue};
use crate::spatial::geometry::TaggedGeometry;
use crate::stats::{BatchRequest, BatchRow, ServiceError, StatisticalService};
use crate::store::{ObjectStore, ObjectStoreRouter, RemoteObject};

// ---------------------------------------------------------------------------
// Python-backed remotes
// ---------------------------------------------------------------------------

/// Statistical service implemented by a Python object with
/// `max_keys_per_call` and `fetch_batch(variables, keys, vintage)`.
struct PyStatisticalService {
    target: PyObject,
    max_keys: usize,
}

fn service_error(py: Python<'_>, err: PyErr) -> ServiceError {
    let value = err.value(py);
    if let Ok(after) = value.getattr("retry_after") {
        let retry_after = after.extract::<f64>().ok().map(Duration::from_secs_f64);
        return ServiceError::RateLimited { retry_after };
    }
    if let Ok(code) = value.getattr("variable").and_then(|v| v.extract::<String>()) {
        return ServiceError::InvalidVariable(code);
    }
    if err.is_instance_of::<PyValueError>(py) {
        return ServiceError::Rejected(err.to_string());
    }
    ServiceError::Transient(err.to_string())
}

impl StatisticalService for PyStatisticalService {
    fn max_keys_per_call(&self) -> usize {
        self.max_keys
    }

    fn fetch_batch(&self, request: &BatchRequest) -> Result<Vec<BatchRow>, ServiceError> {
        Python::with_gil(|py| {
            let rows: Vec<(String, Vec<Option<f64>>)> = self
                .target
                .call_method1(
                    py,
                    "fetch_batch",
                    (request.variables.clone(), request.keys.clone(), request.vintage.clone()),
                )
                .and_then(|r| r.extract(py))
                .map_err(|e| service_error(py, e))?;
            Ok(rows
                .into_iter()
                .map(|(key, values)| BatchRow { key, values })
                .collect())
        })
    }
}

/// Object store implemented by a Python object with `head(uri) ->
/// (version, size | None)` and `download(uri) -> bytes`.
struct PyObjectStore {
    target: PyObject,
}

fn remote_error(err: PyErr) -> EchoError {
    EchoError::Transient(format!("remote store: {err}"))
}

impl ObjectStore for PyObjectStore {
    fn head(&self, uri: &str) -> EchoResult<RemoteObject> {
        Python::with_gil(|py| {
            let (version, size_bytes): (String, Option<u64>) = self
                .target
                .call_method1(py, "head", (uri,))
                .and_then(|r| r.extract(py))
                .map_err(remote_error)?;
            Ok(RemoteObject { version, size_bytes })
        })
    }

    fn download(&self, uri: &str, sink: &mut dyn Write) -> EchoResult<u64> {
        Python::with_gil(|py| {
            let data = self
                .target
                .call_method1(py, "download", (uri,))
                .map_err(remote_error)?;
            let bytes = data.downcast_bound::<PyBytes>(py).map_err(|e| remote_error(e.into()))?;
            sink.write_all(bytes.as_bytes())?;
            Ok(bytes.as_bytes().len() as u64)
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[pyclass(name = "AnalysisEngine")]
pub struct PyAnalysisEngine {
    inner: Arc<AnalysisEngine>,
}

#[pymethods]
impl PyAnalysisEngine {
    /// Build from the environment. `stores` maps URI schemes to Python
    /// object stores; `stats_service` plugs in the statistical service.
    #[new]
    #[pyo3(signature = (stores=None, stats_service=None, stats_max_keys=500))]
    fn new(
        stores: Option<BTreeMap<String, PyObject>>,
        stats_service: Option<PyObject>,
        stats_max_keys: usize,
    ) -> PyResult<Self> {
        let config = EngineConfig::from_env()?;
        let router = ObjectStoreRouter::default();
        for (scheme, target) in stores.unwrap_or_default() {
            router.register(&scheme, Arc::new(PyObjectStore { target }));
        }
        let service = stats_service.map(|target| {
            Arc::new(PyStatisticalService {
                target,
                max_keys: stats_max_keys.max(1),
            }) as Arc<dyn StatisticalService>
        });
        let engine = AnalysisEngine::new(config, Arc::new(router), service)?;
        Ok(Self {
            inner: Arc::new(engine),
        })
    }

    /// Run one analysis and return the result as JSON.
    #[pyo3(signature = (analysis_type, wkt, crs, params_json=None, timeout_ms=None))]
    fn analyze(
        &self,
        py: Python<'_>,
        analysis_type: &str,
        wkt: &str,
        crs: &str,
        params_json: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> PyResult<String> {
        let geometry = TaggedGeometry::from_wkt(wkt, Some(crs))?;
        let params: BTreeMap<String, ParamValue> = match params_json {
            Some(text) if !text.trim().is_empty() => {
                serde_json::from_str(text).map_err(|e| PyValueError::new_err(format!("params: {e}")))?
            }
            _ => BTreeMap::new(),
        };
        let request = AnalysisRequest {
            analysis_type: analysis_type.to_string(),
            geometry,
            params,
        };
        let engine = Arc::clone(&self.inner);
        let result = py.allow_threads(move || {
            let ctx = match timeout_ms {
                Some(ms) => RequestContext::with_timeout(Duration::from_millis(ms)),
                None => engine.default_context(),
            };
            engine.analyze(&request, &ctx)
        })?;
        serde_json::to_string(result.as_ref()).map_err(|e| EchoError::from(e).into())
    }

    fn reload_catalog(&self, py: Python<'_>) -> PyResult<u64> {
        let engine = Arc::clone(&self.inner);
        Ok(py.allow_threads(move || engine.reload_catalog())?)
    }

    fn analysis_types(&self) -> Vec<&'static str> {
        self.inner.executors().names()
    }

    fn dataset_ids(&self) -> Vec<String> {
        self.inner.catalog().dataset_ids().map(str::to_string).collect()
    }

    fn catalog_generation(&self) -> u64 {
        self.inner.catalog().generation
    }

    /// `(hits, misses)` of the result cache.
    fn cache_counters(&self) -> (u64, u64) {
        self.inner.result_cache().counters()
    }
}
