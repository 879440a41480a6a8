//! `nearest_features`: the k closest features of a layer to the request
//! geometry, with distances in metres.

use serde_json::Value;

use crate::analysis::params::{ParamSchema, ParamSpec, Params};
use crate::analysis::{output_feature, require_layer, AnalysisExecutor, ExecutionInputs, Requirements};
use crate::catalog::CatalogSnapshot;
use crate::errors::EchoResult;
use crate::guards::{DEFAULT_NEAREST_K, MAX_NEAREST_K, MAX_SEARCH_DISTANCE_M};
use crate::models::{AnalysisPayload, ParamValue};
use crate::spatial::join::JoinMode;

pub struct NearestFeatures {
    schema: ParamSchema,
}

impl Default for NearestFeatures {
    fn default() -> Self {
        Self::new()
    }
}

impl NearestFeatures {
    pub fn new() -> Self {
        let schema = ParamSchema::new(vec![
            ParamSpec::text("layer").required(),
            ParamSpec::integer("k")
                .range(1.0, MAX_NEAREST_K as f64)
                .default(ParamValue::Integer(DEFAULT_NEAREST_K)),
            ParamSpec::number("max_distance_m").range(0.0, MAX_SEARCH_DISTANCE_M),
            ParamSpec::boolean("include_geometry").default(ParamValue::Bool(true)),
        ]);
        Self { schema }
    }
}

impl AnalysisExecutor for NearestFeatures {
    fn name(&self) -> &'static str {
        "nearest_features"
    }

    fn version(&self) -> u32 {
        1
    }

    fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    fn requirements(&self, params: &Params, catalog: &CatalogSnapshot) -> EchoResult<Requirements> {
        let layer_id = params.require_text("layer")?;
        require_layer(catalog, "layer", layer_id, None)?;
        let mut req = Requirements::default();
        req.dataset(layer_id);
        Ok(req)
    }

    fn execute(&self, inputs: &ExecutionInputs<'_>) -> EchoResult<AnalysisPayload> {
        let params = inputs.params;
        let layer_id = params.require_text("layer")?;
        let layer = inputs.data.layer(layer_id)?;
        let mode = JoinMode::Nearest {
            k: params.integer("k").unwrap_or(DEFAULT_NEAREST_K).max(1) as usize,
            max_distance_m: params.number("max_distance_m"),
        };
        let result = inputs.joins.join(inputs.geometry, &layer, &mode)?;
        let include_geometry = params.bool("include_geometry");

        let mut payload = AnalysisPayload {
            diagnostics: result.diagnostics,
            ..AnalysisPayload::default()
        };
        let distances: Vec<f64> = result.matches.iter().filter_map(|m| m.distance_m).collect();
        for (rank, m) in result.matches.iter().enumerate() {
            let feature = layer.feature(m.index);
            let extra = [
                ("rank".to_string(), Value::from(rank + 1)),
                ("distance_m".to_string(), m.distance_m.map(Value::from).unwrap_or(Value::Null)),
            ];
            let geometry = include_geometry.then_some(&feature.geometry);
            payload.features.push(output_feature(layer_id, feature, geometry, extra));
        }

        payload
            .metrics
            .insert("returned_count".to_string(), Some(distances.len() as f64));
        payload
            .metrics
            .insert("nearest_distance_m".to_string(), distances.first().copied());
        let mean = (!distances.is_empty()).then(|| distances.iter().sum::<f64>() / distances.len() as f64);
        payload.metrics.insert("mean_distance_m".to_string(), mean);
        Ok(payload)
    }
}
