//! `overlay_statistics`: area-weighted statistics of variables over a
//! polygon layer clipped to the request geometry.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::analysis::params::{ParamSchema, ParamSpec, Params};
use crate::analysis::{require_layer, AnalysisExecutor, ExecutionInputs, Requirements};
use crate::catalog::CatalogSnapshot;
use crate::errors::{EchoError, EchoResult};
use crate::guards::MAX_REQUEST_VARIABLES;
use crate::models::{AnalysisPayload, DatasetDescriptor, ParamValue, VariableSpec};
use crate::spatial::geometry::GeometryFamily;
use crate::spatial::join::{AggregateSpec, JoinMode, Statistic, ValueSource};

const STATISTICS: &[&str] = &["sum", "mean", "density"];

/// Where one requested variable's values come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VariableOrigin {
    Table(String),
    Service,
}

pub struct OverlayStatistics {
    schema: ParamSchema,
}

impl Default for OverlayStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayStatistics {
    pub fn new() -> Self {
        let schema = ParamSchema::new(vec![
            ParamSpec::text("layer")
                .required()
                .describe("polygon layer whose features carry the values"),
            ParamSpec::text_list("variables")
                .required()
                .range(1.0, MAX_REQUEST_VARIABLES as f64),
            ParamSpec::text_list("statistics")
                .allowed(STATISTICS)
                .range(1.0, STATISTICS.len() as f64)
                .default(ParamValue::List(STATISTICS.iter().map(|s| s.to_string()).collect())),
            ParamSpec::text("join_key").describe("feature property matched against table keys"),
        ]);
        Self { schema }
    }

    fn origins(
        params: &Params,
        catalog: &CatalogSnapshot,
    ) -> EchoResult<IndexMap<String, VariableOrigin>> {
        let mut origins = IndexMap::new();
        for variable in params.list("variables").unwrap_or_default() {
            if origins.contains_key(variable) {
                continue;
            }
            let origin = if let Some(table) = catalog.table_for_variable(variable) {
                VariableOrigin::Table(table.id.clone())
            } else if catalog.is_service_variable(variable) {
                VariableOrigin::Service
            } else {
                return Err(EchoError::InvalidVariable(variable.clone()));
            };
            origins.insert(variable.clone(), origin);
        }
        Ok(origins)
    }

    /// Feature property used to look up rows: the explicit parameter, else
    /// the layer's join key, else the table's.
    fn join_key(
        params: &Params,
        layer: &DatasetDescriptor,
        table: Option<&DatasetDescriptor>,
    ) -> EchoResult<String> {
        params
            .text("join_key")
            .or_else(|| layer.primary_join_key())
            .or_else(|| table.and_then(|t| t.primary_join_key()))
            .map(str::to_string)
            .ok_or_else(|| {
                EchoError::invalid_parameter(
                    "join_key",
                    format!("layer `{}` declares no join key", layer.id),
                )
            })
    }

    fn statistics(params: &Params) -> EchoResult<Vec<Statistic>> {
        params
            .list("statistics")
            .unwrap_or_default()
            .iter()
            .map(|s| s.parse())
            .collect()
    }
}

impl AnalysisExecutor for OverlayStatistics {
    fn name(&self) -> &'static str {
        "overlay_statistics"
    }

    fn version(&self) -> u32 {
        1
    }

    fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    fn requirements(&self, params: &Params, catalog: &CatalogSnapshot) -> EchoResult<Requirements> {
        let layer_id = params.require_text("layer")?;
        let layer = require_layer(catalog, "layer", layer_id, Some(GeometryFamily::Polygon))?;
        let mut req = Requirements::default();
        req.dataset(layer_id);
        for (variable, origin) in Self::origins(params, catalog)? {
            match origin {
                VariableOrigin::Table(table_id) => {
                    let table = catalog.resolve(&table_id)?;
                    Self::join_key(params, &layer, Some(&table))?;
                    req.dataset(&table_id);
                }
                VariableOrigin::Service => {
                    Self::join_key(params, &layer, None)?;
                    if let Some(spec) = catalog.statistics.variables.get(&variable) {
                        req.service_variables.push(spec.clone());
                    }
                }
            }
        }
        Ok(req)
    }

    fn execute(&self, inputs: &ExecutionInputs<'_>) -> EchoResult<AnalysisPayload> {
        let params = inputs.params;
        let layer_id = params.require_text("layer")?;
        let layer_desc = inputs.catalog.resolve(layer_id)?;
        let layer = inputs.data.layer(layer_id)?;
        let statistics = Self::statistics(params)?;
        let origins = Self::origins(params, inputs.catalog)?;

        let mut groups: IndexMap<VariableOrigin, Vec<String>> = IndexMap::new();
        for (variable, origin) in &origins {
            groups.entry(origin.clone()).or_default().push(variable.clone());
        }

        let mut aggregates: IndexMap<String, Option<f64>> = IndexMap::new();
        let mut payload = AnalysisPayload::default();
        let mut base_area_m2 = 0.0;
        let mut matched = 0usize;

        for (origin, variables) in groups {
            inputs.ctx.check("overlay statistics")?;
            let (table, feature_key) = match &origin {
                VariableOrigin::Table(table_id) => {
                    let table_desc = inputs.catalog.resolve(table_id)?;
                    let key = Self::join_key(params, &layer_desc, Some(&table_desc))?;
                    (inputs.data.table(table_id)?, key)
                }
                VariableOrigin::Service => {
                    let key = Self::join_key(params, &layer_desc, None)?;
                    let hits = inputs.joins.join(inputs.geometry, &layer, &JoinMode::Intersects)?;
                    let keys: Vec<String> = hits
                        .matches
                        .iter()
                        .filter_map(|m| layer.feature(m.index).key(&key))
                        .collect();
                    let specs: Vec<VariableSpec> = variables
                        .iter()
                        .filter_map(|v| inputs.catalog.statistics.variables.get(v).cloned())
                        .collect();
                    (Arc::new(inputs.data.statistics(&specs, &keys)?), key)
                }
            };

            let spec = AggregateSpec::new(
                variables,
                statistics.clone(),
                ValueSource::Table { table, feature_key },
            );
            let result = inputs
                .joins
                .join(inputs.geometry, &layer, &JoinMode::OverlayAggregate(spec))?;
            base_area_m2 = result.base_area_m2;
            matched = matched.max(result.matches.len());
            aggregates.extend(result.aggregates);
            for line in result.diagnostics {
                if !payload.diagnostics.contains(&line) {
                    payload.diagnostics.push(line);
                }
            }
        }

        for variable in origins.keys() {
            for stat in &statistics {
                let name = format!("{variable}_{stat}");
                let value = aggregates.get(&name).copied().flatten();
                payload.metrics.insert(name, value);
            }
        }
        payload
            .metrics
            .insert("base_area_km2".to_string(), Some(base_area_m2 / 1_000_000.0));
        payload
            .metrics
            .insert("matched_features".to_string(), Some(matched as f64));
        Ok(payload)
    }
}
