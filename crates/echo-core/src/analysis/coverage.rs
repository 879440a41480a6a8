//! `zone_coverage`: how much of the request geometry each zone code covers.
//!
//! Zones are clipped to the request geometry; areas are summed per code and
//! reported with their share of the request area. Clipped zone geometries
//! can be returned, optionally simplified on the equal-area plane so the
//! tolerance is in metres.

use std::collections::BTreeMap;

use geo::Simplify;
use geo_types::Geometry;
use serde_json::Value;

use crate::analysis::params::{ParamSchema, ParamSpec, Params};
use crate::analysis::{output_feature, require_layer, AnalysisExecutor, ExecutionInputs, Requirements};
use crate::catalog::CatalogSnapshot;
use crate::errors::{EchoError, EchoResult};
use crate::guards::MAX_SIMPLIFY_TOLERANCE_M;
use crate::models::{AnalysisPayload, DatasetDescriptor, ParamValue};
use crate::spatial::crs::Crs;
use crate::spatial::geometry::{from_geographic, to_geographic, GeometryFamily};
use crate::spatial::join::{AggregateSpec, JoinMode};

/// Code reported for zones without a value in the code property.
const UNCODED: &str = "uncoded";

pub struct ZoneCoverage {
    schema: ParamSchema,
}

impl Default for ZoneCoverage {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneCoverage {
    pub fn new() -> Self {
        let schema = ParamSchema::new(vec![
            ParamSpec::text("layer").required(),
            ParamSpec::text("code_property").describe("defaults to the layer's join key"),
            ParamSpec::text_list("codes").describe("report only these zone codes"),
            ParamSpec::boolean("include_geometry").default(ParamValue::Bool(false)),
            ParamSpec::number("simplify_tolerance_m")
                .range(0.0, MAX_SIMPLIFY_TOLERANCE_M)
                .default(ParamValue::Number(0.0)),
        ]);
        Self { schema }
    }

    fn code_property(params: &Params, layer: &DatasetDescriptor) -> EchoResult<String> {
        params
            .text("code_property")
            .or_else(|| layer.primary_join_key())
            .map(str::to_string)
            .ok_or_else(|| {
                EchoError::invalid_parameter(
                    "code_property",
                    format!("layer `{}` declares no join key", layer.id),
                )
            })
    }
}

fn simplified(piece: &Geometry<f64>, plane: Crs, tolerance_m: f64) -> EchoResult<Geometry<f64>> {
    if tolerance_m <= 0.0 {
        return Ok(piece.clone());
    }
    let planar = match from_geographic(piece, plane)? {
        Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(mp.simplify(&tolerance_m)),
        Geometry::Polygon(p) => Geometry::Polygon(p.simplify(&tolerance_m)),
        other => other,
    };
    to_geographic(&planar, plane)
}

impl AnalysisExecutor for ZoneCoverage {
    fn name(&self) -> &'static str {
        "zone_coverage"
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
        Self::code_property(params, &layer)?;
        let mut req = Requirements::default();
        req.dataset(layer_id);
        Ok(req)
    }

    fn execute(&self, inputs: &ExecutionInputs<'_>) -> EchoResult<AnalysisPayload> {
        let params = inputs.params;
        let layer_id = params.require_text("layer")?;
        let descriptor = inputs.catalog.resolve(layer_id)?;
        let code_property = Self::code_property(params, &descriptor)?;
        let wanted = params.list("codes");
        let include_geometry = params.bool("include_geometry");
        let tolerance_m = params.number("simplify_tolerance_m").unwrap_or(0.0);

        let layer = inputs.data.layer(layer_id)?;
        let mode = JoinMode::OverlayAggregate(AggregateSpec::coverage(include_geometry));
        let result = inputs.joins.join(inputs.geometry, &layer, &mode)?;
        let base_area_m2 = result.base_area_m2;
        let share = |area: f64| (base_area_m2 > 0.0).then(|| area / base_area_m2);

        let mut payload = AnalysisPayload {
            diagnostics: result.diagnostics.clone(),
            ..AnalysisPayload::default()
        };
        let mut areas: BTreeMap<String, f64> = BTreeMap::new();
        let mut pieces = Vec::new();
        for m in &result.matches {
            let feature = layer.feature(m.index);
            let code = feature
                .key(&code_property)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| UNCODED.to_string());
            if let Some(wanted) = wanted {
                if !wanted.iter().any(|w| *w == code) {
                    continue;
                }
            }
            let area = m.overlap.unwrap_or(0.0);
            *areas.entry(code.clone()).or_default() += area;
            if include_geometry {
                pieces.push((code, feature, area, m.geometry.as_ref()));
            }
        }

        pieces.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        for (code, feature, area, piece) in pieces {
            inputs.ctx.check("zone clipping")?;
            let geometry = piece
                .map(|g| simplified(g, result.plane, tolerance_m))
                .transpose()?;
            let extra = [
                ("zone_code".to_string(), Value::from(code)),
                ("area_m2".to_string(), Value::from(area)),
                ("share".to_string(), share(area).map(Value::from).unwrap_or(Value::Null)),
            ];
            payload
                .features
                .push(output_feature(layer_id, feature, geometry.as_ref(), extra));
        }

        let covered: f64 = areas.values().sum();
        payload.metrics.insert("base_area_m2".to_string(), Some(base_area_m2));
        payload.metrics.insert("covered_area_m2".to_string(), Some(covered));
        payload.metrics.insert("covered_share".to_string(), share(covered));
        payload.metrics.insert("zone_count".to_string(), Some(areas.len() as f64));
        for (code, area) in &areas {
            payload.metrics.insert(format!("{code}_area_m2"), Some(*area));
            payload.metrics.insert(format!("{code}_share"), share(*area));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::analysis::testing::{mga_layer, raw, run, square_km, MemoryData};
    use crate::spatial::bvh::BBox;
    use crate::spatial::geometry::parse_wkt;

    fn zones() -> MemoryData {
        let mut data = MemoryData::default();
        data.layers.insert(
            "zones".into(),
            mga_layer(
                "zones",
                vec![
                    // West half of the square, extending outside it.
                    raw(
                        "z-west",
                        "POLYGON((319000 5812000, 320500 5812000, 320500 5813000, 319000 5813000, 319000 5812000))",
                        json!({"zone_code": "GRZ1"}),
                    ),
                    // North-east quarter.
                    raw(
                        "z-ne",
                        "POLYGON((320500 5812500, 321000 5812500, 321000 5813000, 320500 5813000, 320500 5812500))",
                        json!({"zone_code": "C1Z"}),
                    ),
                    // South-east quarter, same code as the west half.
                    raw(
                        "z-se",
                        "POLYGON((320500 5812000, 321000 5812000, 321000 5812500, 320500 5812500, 320500 5812000))",
                        json!({"zone_code": "GRZ1"}),
                    ),
                ],
            ),
        );
        data
    }

    fn approx(value: Option<f64>, expected: f64, tolerance: f64) -> bool {
        value.is_some_and(|v| (v - expected).abs() <= tolerance)
    }

    #[test]
    fn test_areas_and_shares_by_code() {
        let payload = run(
            &ZoneCoverage::new(),
            &square_km(),
            &[("layer", ParamValue::Text("zones".into()))],
            &zones(),
        )
        .unwrap();
        assert!(approx(payload.metrics["GRZ1_share"], 0.75, 1e-3));
        assert!(approx(payload.metrics["C1Z_share"], 0.25, 1e-3));
        assert!(approx(payload.metrics["covered_share"], 1.0, 1e-3));
        assert!(approx(payload.metrics["C1Z_area_m2"], 250_000.0, 250.0));
        assert_eq!(payload.metrics["zone_count"], Some(2.0));
        assert!(payload.features.is_empty());
    }

    #[test]
    fn test_code_filter_and_geometries() {
        let payload = run(
            &ZoneCoverage::new(),
            &square_km(),
            &[
                ("layer", ParamValue::Text("zones".into())),
                ("codes", ParamValue::List(vec!["GRZ1".into()])),
                ("include_geometry", ParamValue::Bool(true)),
                ("simplify_tolerance_m", ParamValue::Number(5.0)),
            ],
            &zones(),
        )
        .unwrap();
        assert!(!payload.metrics.contains_key("C1Z_share"));
        let ids: Vec<&str> = payload.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["z-se", "z-west"]);

        // The clipped west zone stays within the request square.
        let west = parse_wkt(&payload.features[1].wkt).unwrap();
        let clipped = BBox::from_geometry(&west).unwrap();
        let square = BBox::from_geometry(&square_km().to_geographic().unwrap()).unwrap();
        assert!(clipped.min_x >= square.min_x - 1e-6);
        assert!(approx(
            payload.features[1].properties["share"].as_f64(),
            0.5,
            1e-3
        ));
    }

    #[test]
    fn test_simplification_drops_vertices() {
        let plane = Crs::equal_area_at(145.0, -37.8);
        let wiggly = parse_wkt(
            "POLYGON((0 0, 500 0.5, 1000 0, 1000 1000, 500 999.5, 0 1000, 0 0))",
        )
        .unwrap();
        let geographic = to_geographic(&wiggly, plane).unwrap();
        let simple = simplified(&geographic, plane, 5.0).unwrap();
        let count = |g: &Geometry<f64>| geo::CoordsIter::coords_count(g);
        assert!(count(&simple) < count(&geographic));
        assert_eq!(simplified(&geographic, plane, 0.0).unwrap(), geographic);
    }
}
