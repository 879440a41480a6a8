//! `feature_selection`: features of one or more layers that intersect (or
//! lie inside) the request geometry, with an optional type filter, a cap on
//! returned features and per-type counts.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::analysis::params::{ParamSchema, ParamSpec, Params};
use crate::analysis::{output_feature, require_layer, AnalysisExecutor, ExecutionInputs, Requirements};
use crate::catalog::CatalogSnapshot;
use crate::errors::{EchoError, EchoResult};
use crate::guards::{DEFAULT_SELECTED_FEATURES, MAX_REQUEST_LAYERS, MAX_SELECTED_FEATURES};
use crate::models::{AnalysisPayload, ParamValue};
use crate::spatial::join::JoinMode;
use crate::spatial::layer::LayerFeature;

/// Bucket for features without a value in the type property.
const UNTYPED: &str = "unknown";

pub struct FeatureSelection {
    schema: ParamSchema,
}

impl Default for FeatureSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureSelection {
    pub fn new() -> Self {
        let schema = ParamSchema::new(vec![
            ParamSpec::text_list("layers")
                .required()
                .range(1.0, MAX_REQUEST_LAYERS as f64),
            ParamSpec::text("predicate")
                .allowed(&["intersects", "contains"])
                .default(ParamValue::Text("intersects".into())),
            ParamSpec::text("type_property").describe("feature property holding the feature type"),
            ParamSpec::text_list("types").describe("keep only these types"),
            ParamSpec::integer("max_features")
                .range(0.0, MAX_SELECTED_FEATURES as f64)
                .default(ParamValue::Integer(DEFAULT_SELECTED_FEATURES)),
            ParamSpec::boolean("include_geometry").default(ParamValue::Bool(true)),
        ]);
        Self { schema }
    }
}

impl AnalysisExecutor for FeatureSelection {
    fn name(&self) -> &'static str {
        "feature_selection"
    }

    fn version(&self) -> u32 {
        1
    }

    fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    fn requirements(&self, params: &Params, catalog: &CatalogSnapshot) -> EchoResult<Requirements> {
        let mut req = Requirements::default();
        for id in params.list("layers").unwrap_or_default() {
            require_layer(catalog, "layers", id, None)?;
            req.dataset(id);
        }
        if params.list("types").is_some() && params.text("type_property").is_none() {
            return Err(EchoError::invalid_parameter(
                "types",
                "requires `type_property`",
            ));
        }
        Ok(req)
    }

    fn execute(&self, inputs: &ExecutionInputs<'_>) -> EchoResult<AnalysisPayload> {
        let params = inputs.params;
        let mode = match params.text("predicate") {
            Some("contains") => JoinMode::Contains,
            _ => JoinMode::Intersects,
        };
        let type_property = params.text("type_property");
        let wanted = params.list("types");
        let cap = params.integer("max_features").unwrap_or(DEFAULT_SELECTED_FEATURES).max(0) as usize;
        let include_geometry = params.bool("include_geometry");

        let mut payload = AnalysisPayload::default();
        let mut total = 0usize;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();

        for layer_id in params.list("layers").unwrap_or_default() {
            inputs.ctx.check("feature selection")?;
            let layer = inputs.data.layer(layer_id)?;
            let result = inputs.joins.join(inputs.geometry, &layer, &mode)?;
            payload.diagnostics.extend(result.diagnostics);

            let mut selected: Vec<(String, &LayerFeature)> = Vec::new();
            for m in &result.matches {
                let feature = layer.feature(m.index);
                let kind = type_property
                    .and_then(|p| feature.key(p))
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| UNTYPED.to_string());
                if let Some(wanted) = wanted {
                    if !wanted.iter().any(|w| *w == kind) {
                        continue;
                    }
                }
                selected.push((kind, feature));
            }
            selected.sort_by(|a, b| a.1.id.cmp(&b.1.id));

            payload
                .metrics
                .insert(format!("{layer_id}_count"), Some(selected.len() as f64));
            total += selected.len();
            for (kind, feature) in selected {
                if type_property.is_some() {
                    *by_type.entry(kind.clone()).or_default() += 1;
                }
                if payload.features.len() < cap {
                    let geometry = include_geometry.then_some(&feature.geometry);
                    let mut extra = vec![("layer_dataset".to_string(), Value::from(layer_id.as_str()))];
                    if type_property.is_some() {
                        extra.push(("feature_type".to_string(), Value::from(kind)));
                    }
                    payload.features.push(output_feature(layer_id, feature, geometry, extra));
                }
            }
        }

        for (kind, count) in by_type {
            payload
                .metrics
                .insert(format!("type_count:{kind}"), Some(count as f64));
        }
        payload.metrics.insert("total_count".to_string(), Some(total as f64));
        payload
            .metrics
            .insert("returned_count".to_string(), Some(payload.features.len() as f64));
        if total > payload.features.len() {
            payload.diagnostics.push(format!(
                "feature list truncated to {} of {total}",
                payload.features.len()
            ));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::analysis::testing::{mga_layer, raw, run, square_km, MemoryData};

    fn stops() -> MemoryData {
        let mut data = MemoryData::default();
        data.layers.insert(
            "stops".into(),
            mga_layer(
                "stops",
                vec![
                    raw("s3", "POINT(320500 5812500)", json!({"mode": "train"})),
                    raw("s1", "POINT(320100 5812100)", json!({"mode": "bus"})),
                    raw("s2", "POINT(320900 5812900)", json!({"mode": "bus"})),
                    raw("s4", "POINT(320200 5812800)", json!({})),
                    raw("far", "POINT(330000 5812000)", json!({"mode": "train"})),
                ],
            ),
        );
        data
    }

    #[test]
    fn test_selects_sorted_features_with_type_counts() {
        let payload = run(
            &FeatureSelection::new(),
            &square_km(),
            &[
                ("layers", ParamValue::List(vec!["stops".into()])),
                ("type_property", ParamValue::Text("mode".into())),
            ],
            &stops(),
        )
        .unwrap();
        let ids: Vec<&str> = payload.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4"]);
        assert_eq!(payload.metrics["stops_count"], Some(4.0));
        assert_eq!(payload.metrics["type_count:bus"], Some(2.0));
        assert_eq!(payload.metrics["type_count:train"], Some(1.0));
        assert_eq!(payload.metrics["type_count:unknown"], Some(1.0));
        assert!(payload.features[0].wkt.starts_with("POINT"));
        assert_eq!(payload.features[2].properties["feature_type"], json!("train"));
    }

    #[test]
    fn test_type_filter_and_cap() {
        let payload = run(
            &FeatureSelection::new(),
            &square_km(),
            &[
                ("layers", ParamValue::List(vec!["stops".into()])),
                ("type_property", ParamValue::Text("mode".into())),
                ("types", ParamValue::List(vec!["bus".into()])),
                ("max_features", ParamValue::Integer(1)),
                ("include_geometry", ParamValue::Bool(false)),
            ],
            &stops(),
        )
        .unwrap();
        assert_eq!(payload.features.len(), 1);
        assert_eq!(payload.features[0].id, "s1");
        assert!(payload.features[0].wkt.is_empty());
        assert_eq!(payload.metrics["total_count"], Some(2.0));
        assert_eq!(payload.metrics["returned_count"], Some(1.0));
        assert!(payload.diagnostics.iter().any(|d| d.contains("truncated to 1 of 2")));
    }

    #[test]
    fn test_types_without_property_is_rejected() {
        let err = run(
            &FeatureSelection::new(),
            &square_km(),
            &[
                ("layers", ParamValue::List(vec!["stops".into()])),
                ("types", ParamValue::List(vec!["bus".into()])),
            ],
            &stops(),
        )
        .unwrap_err();
        assert!(matches!(err, EchoError::InvalidParameter { ref name, .. } if name == "types"));
    }
}
