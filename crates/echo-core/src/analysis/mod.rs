//! Analysis executors and the registry that dispatches requests to them.
//!
//! An executor is named and versioned, declares its parameters and the
//! datasets it reads, and turns validated inputs into an
//! [`AnalysisPayload`]. It never fetches anything itself: prepared layers,
//! tables and statistics come through [`DatasetAccess`], which the engine
//! backs with storage sync and the statistical client.

pub mod cache;
pub mod coverage;
pub mod nearest;
pub mod overlay;
pub mod params;
pub mod selection;

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::catalog::CatalogSnapshot;
use crate::context::RequestContext;
use crate::errors::{EchoError, EchoResult};
use crate::models::{AnalysisPayload, AttributeTable, DatasetDescriptor, DatasetKind, OutputFeature, VariableSpec};
use crate::spatial::geometry::{to_wkt, GeometryFamily, TaggedGeometry};
use crate::spatial::join::SpatialJoinEngine;
use crate::spatial::layer::{LayerFeature, PreparedLayer};

pub use cache::{fingerprint, CacheOutcome, ResultCache};
pub use params::{ParamSchema, ParamSpec, ParamType, Params};

/// What an executor needs before it can run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    /// Catalog datasets that must be local and current.
    pub datasets: Vec<String>,
    /// Variables that will be requested from the statistical service.
    pub service_variables: Vec<VariableSpec>,
}

impl Requirements {
    pub fn dataset(&mut self, id: &str) {
        if !self.datasets.iter().any(|d| d == id) {
            self.datasets.push(id.to_string());
        }
    }
}

/// Read access to the data a request was planned against.
pub trait DatasetAccess: Send + Sync {
    fn layer(&self, dataset_id: &str) -> EchoResult<Arc<PreparedLayer>>;

    fn table(&self, dataset_id: &str) -> EchoResult<Arc<AttributeTable>>;

    /// Values for `variables` at `keys` from the statistical service.
    fn statistics(&self, variables: &[VariableSpec], keys: &[String]) -> EchoResult<AttributeTable>;
}

/// Everything an executor sees for one request.
pub struct ExecutionInputs<'a> {
    pub geometry: &'a TaggedGeometry,
    pub params: &'a Params,
    pub catalog: &'a CatalogSnapshot,
    pub data: &'a dyn DatasetAccess,
    pub joins: &'a SpatialJoinEngine,
    pub ctx: &'a RequestContext,
}

pub trait AnalysisExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bumped whenever the executor's output for identical inputs changes.
    fn version(&self) -> u32;

    fn schema(&self) -> &ParamSchema;

    fn requirements(&self, params: &Params, catalog: &CatalogSnapshot) -> EchoResult<Requirements>;

    fn execute(&self, inputs: &ExecutionInputs<'_>) -> EchoResult<AnalysisPayload>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: IndexMap<&'static str, Arc<dyn AnalysisExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in executor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(overlay::OverlayStatistics::new()));
        registry.register(Arc::new(selection::FeatureSelection::new()));
        registry.register(Arc::new(nearest::NearestFeatures::new()));
        registry.register(Arc::new(coverage::ZoneCoverage::new()));
        registry
    }

    /// Add or replace the executor registered under its name.
    pub fn register(&mut self, executor: Arc<dyn AnalysisExecutor>) {
        self.executors.insert(executor.name(), executor);
    }

    pub fn get(&self, analysis_type: &str) -> EchoResult<Arc<dyn AnalysisExecutor>> {
        self.executors.get(analysis_type).cloned().ok_or_else(|| {
            EchoError::invalid_parameter(
                "analysis_type",
                format!(
                    "unknown analysis `{analysis_type}` (available: {})",
                    self.names().join(", ")
                ),
            )
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.executors.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by executors
// ---------------------------------------------------------------------------

/// Resolve `id` and require a spatial layer, optionally of one family.
pub(crate) fn require_layer(
    catalog: &CatalogSnapshot,
    param: &str,
    id: &str,
    family: Option<GeometryFamily>,
) -> EchoResult<Arc<DatasetDescriptor>> {
    let descriptor = catalog.resolve(id)?;
    match &descriptor.kind {
        DatasetKind::Layer { geometry, .. } => {
            if let Some(expected) = family {
                if *geometry != expected {
                    return Err(EchoError::invalid_parameter(
                        param,
                        format!("dataset `{id}` is a {geometry:?} layer, expected {expected:?}"),
                    ));
                }
            }
            Ok(descriptor)
        }
        DatasetKind::AttributeTable { .. } => Err(EchoError::invalid_parameter(
            param,
            format!("dataset `{id}` is an attribute table, not a layer"),
        )),
    }
}

/// A layer feature as an output feature, with `extra` properties merged in.
pub(crate) fn output_feature(
    layer: &str,
    feature: &LayerFeature,
    geometry: Option<&geo_types::Geometry<f64>>,
    extra: impl IntoIterator<Item = (String, Value)>,
) -> OutputFeature {
    let mut properties: Map<String, Value> = feature.properties.clone();
    properties.extend(extra);
    OutputFeature {
        layer: layer.to_string(),
        id: feature.id.clone(),
        wkt: geometry.map(to_wkt).unwrap_or_default(),
        properties,
    }
}
