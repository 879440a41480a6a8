//! Spatial join engine.
//!
//! Every join runs on a Lambert azimuthal equal-area plane centred on the
//! base geometry, so areas and lengths are in square metres and metres.
//! Reference features are pre-filtered with the layer's geographic index
//! and only candidates are reprojected.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use geo::{Area, BooleanOps, CoordsIter, Intersects, Relate};
use geo_types::{Geometry, MultiPolygon};
use indexmap::IndexMap;
use serde::Serialize;

use crate::errors::{EchoError, EchoResult};
use crate::models::AttributeTable;
use crate::spatial::bvh::BBox;
use crate::spatial::crs::Crs;
use crate::spatial::geometry::{
    areal_part, from_geographic, geodesic_distance, geodesic_length, geographic_anchor,
    linear_part, planar_area, to_geographic, Extent, TaggedGeometry,
};
use crate::spatial::layer::{LayerFeature, PreparedLayer};

/// Starting radius of the nearest-neighbour search window.
pub const DEFAULT_INITIAL_SEARCH_RADIUS_M: f64 = 500.0;

/// Conservative metres per degree of latitude (the polar value is larger).
const METRES_PER_DEGREE: f64 = 110_574.0;

const SQ_METRES_PER_SQ_KM: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    /// Sum of values weighted by the overlapped fraction of each feature.
    Sum,
    /// Mean of values weighted by overlap area (length, count).
    Mean,
    /// Weighted sum per square kilometre of base area.
    Density,
}

impl Statistic {
    pub const ALL: [Statistic; 3] = [Statistic::Sum, Statistic::Mean, Statistic::Density];

    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Sum => "sum",
            Statistic::Mean => "mean",
            Statistic::Density => "density",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = EchoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Statistic::Sum),
            "mean" | "avg" | "average" => Ok(Statistic::Mean),
            "density" => Ok(Statistic::Density),
            other => Err(EchoError::invalid_parameter(
                "statistics",
                format!("unsupported statistic `{other}`"),
            )),
        }
    }
}

/// Where attribute values for weighting come from.
#[derive(Debug, Clone)]
pub enum ValueSource {
    /// Numeric feature properties named like the attributes.
    Property,
    /// Rows of `table` matched by the feature's `feature_key` property.
    Table {
        table: Arc<AttributeTable>,
        feature_key: String,
    },
}

impl ValueSource {
    fn value(&self, feature: &LayerFeature, attribute: &str) -> Option<f64> {
        match self {
            ValueSource::Property => feature.numeric(attribute),
            ValueSource::Table { table, feature_key } => {
                table.value(&feature.key(feature_key)?, attribute)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub attributes: Vec<String>,
    pub statistics: Vec<Statistic>,
    pub source: ValueSource,
    /// Return each feature's intersection with the base (EPSG:4326).
    pub keep_geometry: bool,
}

impl AggregateSpec {
    pub fn new(attributes: Vec<String>, statistics: Vec<Statistic>, source: ValueSource) -> Self {
        Self {
            attributes,
            statistics,
            source,
            keep_geometry: false,
        }
    }

    /// Overlap measurement only, no attribute values.
    pub fn coverage(keep_geometry: bool) -> Self {
        Self {
            attributes: vec![],
            statistics: vec![],
            source: ValueSource::Property,
            keep_geometry,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JoinMode {
    Intersects,
    /// Features entirely inside the base geometry.
    Contains,
    Nearest {
        k: usize,
        max_distance_m: Option<f64>,
    },
    OverlayAggregate(AggregateSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinMatch {
    /// Index into the prepared layer.
    pub index: usize,
    pub id: String,
    pub distance_m: Option<f64>,
    /// Overlapped area (m²), length (m) or point count.
    pub overlap: Option<f64>,
    /// Overlapped fraction of the feature, in `[0, 1]`.
    pub weight: Option<f64>,
    /// Intersection with the base in EPSG:4326, when requested.
    pub geometry: Option<Geometry<f64>>,
}

impl JoinMatch {
    fn plain(index: usize, id: &str) -> Self {
        Self {
            index,
            id: id.to_string(),
            distance_m: None,
            overlap: None,
            weight: None,
            geometry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    /// Equal-area plane the join ran on.
    pub plane: Crs,
    pub base_area_m2: f64,
    pub matches: Vec<JoinMatch>,
    /// `<attribute>_<statistic>` -> value; `None` when undefined.
    pub aggregates: IndexMap<String, Option<f64>>,
    pub diagnostics: Vec<String>,
}

impl JoinResult {
    fn empty(base: &PreparedBase) -> Self {
        Self {
            plane: base.plane,
            base_area_m2: base.area_m2,
            matches: vec![],
            aggregates: IndexMap::new(),
            diagnostics: vec![],
        }
    }
}

/// The base geometry in both geographic and planar form.
struct PreparedBase {
    plane: Crs,
    planar: Geometry<f64>,
    areal: MultiPolygon<f64>,
    bbox: BBox,
    area_m2: f64,
}

fn prepare_base(base: &TaggedGeometry) -> EchoResult<PreparedBase> {
    let crs = base.require_crs()?;
    if base.geometry.coords_iter().any(|c| !(c.x.is_finite() && c.y.is_finite())) {
        return Err(EchoError::JoinComputation(
            "base geometry has non-finite coordinates".to_string(),
        ));
    }
    let geographic = to_geographic(&base.geometry, crs)?;
    let bbox = BBox::from_geometry(&geographic)
        .ok_or_else(|| EchoError::JoinComputation("base geometry is empty".to_string()))?;
    let anchor = geographic_anchor(&geographic)?;
    let plane = Crs::equal_area_at(anchor.x, anchor.y);
    let planar = from_geographic(&geographic, plane)?;
    let areal = areal_part(&planar);
    let area_m2 = areal.unsigned_area();
    Ok(PreparedBase {
        plane,
        planar,
        areal,
        bbox,
        area_m2,
    })
}

/// Lon/lat window around `bbox` guaranteed to hold every point within
/// `radius_m` metres of it.
fn degree_window(bbox: &BBox, radius_m: f64) -> BBox {
    let dlat = radius_m * 1.1 / METRES_PER_DEGREE;
    let max_abs_lat = (bbox.max_y + dlat).abs().max((bbox.min_y - dlat).abs()).min(89.9);
    let dlon = (radius_m * 1.1 / (METRES_PER_DEGREE * max_abs_lat.to_radians().cos())).min(360.0);
    bbox.expanded(dlon, dlat)
}

fn covers(outer: &BBox, inner: &BBox) -> bool {
    outer.min_x <= inner.min_x
        && outer.min_y <= inner.min_y
        && outer.max_x >= inner.max_x
        && outer.max_y >= inner.max_y
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    weighted_sum: f64,
    overlap_sum: f64,
    overlap_weighted_sum: f64,
    contributors: usize,
    missing: usize,
}

#[derive(Debug, Clone)]
pub struct SpatialJoinEngine {
    pub initial_search_radius_m: f64,
}

impl Default for SpatialJoinEngine {
    fn default() -> Self {
        Self {
            initial_search_radius_m: DEFAULT_INITIAL_SEARCH_RADIUS_M,
        }
    }
}

impl SpatialJoinEngine {
    pub fn join(&self, base: &TaggedGeometry, layer: &PreparedLayer, mode: &JoinMode) -> EchoResult<JoinResult> {
        let base = prepare_base(base)?;
        let mut result = JoinResult::empty(&base);
        if !layer.skipped.is_empty() {
            result.diagnostics.push(format!(
                "{}: {} feature(s) without extent ignored",
                layer.dataset_id,
                layer.skipped.len()
            ));
        }
        match mode {
            JoinMode::Intersects => {
                result.matches = self.filter(&base, layer, false)?;
            }
            JoinMode::Contains => {
                result.matches = self.filter(&base, layer, true)?;
            }
            JoinMode::Nearest { k, max_distance_m } => {
                if *k == 0 {
                    return Err(EchoError::invalid_parameter("k", "must be at least 1"));
                }
                if max_distance_m.is_some_and(|d| !(d.is_finite() && d >= 0.0)) {
                    return Err(EchoError::invalid_parameter(
                        "max_distance_m",
                        "must be a non-negative number",
                    ));
                }
                result.matches = self.nearest(&base, layer, *k, *max_distance_m)?;
            }
            JoinMode::OverlayAggregate(spec) => {
                self.overlay(&base, layer, spec, &mut result)?;
            }
        }
        Ok(result)
    }

    fn filter(&self, base: &PreparedBase, layer: &PreparedLayer, contained: bool) -> EchoResult<Vec<JoinMatch>> {
        let mut matches = Vec::new();
        for idx in layer.candidates(&base.bbox) {
            let feature = layer.feature(idx);
            let planar = from_geographic(&feature.geometry, base.plane)?;
            let hit = if contained {
                base.planar.relate(&planar).is_contains()
            } else {
                base.planar.intersects(&planar)
            };
            if hit {
                matches.push(JoinMatch::plain(idx, &feature.id));
            }
        }
        Ok(matches)
    }

    /// The `k` closest features, ties broken by feature id. The search
    /// window grows until it provably holds the `k` closest or spans the
    /// whole layer.
    fn nearest(
        &self,
        base: &PreparedBase,
        layer: &PreparedLayer,
        k: usize,
        max_distance_m: Option<f64>,
    ) -> EchoResult<Vec<JoinMatch>> {
        let Some(bounds) = layer.bounds() else {
            return Ok(vec![]);
        };
        let cap = max_distance_m.unwrap_or(f64::INFINITY);
        let mut radius = self.initial_search_radius_m.max(1.0).min(cap);
        let mut distances: HashMap<usize, f64> = HashMap::new();

        loop {
            let window = degree_window(&base.bbox, radius);
            for idx in layer.candidates(&window) {
                if distances.contains_key(&idx) {
                    continue;
                }
                let planar = from_geographic(&layer.feature(idx).geometry, base.plane)?;
                distances.insert(idx, geodesic_distance(&base.planar, &planar, base.plane)?);
            }

            let exhaustive = covers(&window, &bounds) || radius >= cap;
            let limit = if exhaustive { cap } else { radius };
            let mut within: Vec<(f64, usize)> = distances
                .iter()
                .filter(|(_, d)| **d <= limit)
                .map(|(i, d)| (*d, *i))
                .collect();

            if within.len() >= k || exhaustive {
                within.sort_by(|a, b| {
                    a.0.total_cmp(&b.0)
                        .then_with(|| layer.feature(a.1).id.cmp(&layer.feature(b.1).id))
                });
                within.truncate(k);
                return Ok(within
                    .into_iter()
                    .map(|(d, idx)| JoinMatch {
                        distance_m: Some(d),
                        ..JoinMatch::plain(idx, &layer.feature(idx).id)
                    })
                    .collect());
            }
            radius = (radius * 2.0).min(cap);
        }
    }

    fn overlay(
        &self,
        base: &PreparedBase,
        layer: &PreparedLayer,
        spec: &AggregateSpec,
        result: &mut JoinResult,
    ) -> EchoResult<()> {
        let mut accumulators = vec![Accumulator::default(); spec.attributes.len()];
        let mut degenerate: Vec<&str> = Vec::new();

        if base.area_m2 <= 0.0 {
            result
                .diagnostics
                .push("base geometry has zero area; aggregates are undefined".to_string());
            for attribute in &spec.attributes {
                for stat in &spec.statistics {
                    result.aggregates.insert(format!("{attribute}_{stat}"), None);
                }
            }
            return Ok(());
        }

        for idx in layer.candidates(&base.bbox) {
            let feature = layer.feature(idx);
            let planar = from_geographic(&feature.geometry, base.plane)?;
            let total = match feature.extent {
                Extent::Areal => planar_area(&planar),
                Extent::Linear => geodesic_length(&feature.geometry),
                Extent::Discrete => planar.coords_count() as f64,
                Extent::Degenerate => 0.0,
            };
            if !(total > 0.0) {
                degenerate.push(&feature.id);
                continue;
            }

            // Pieces are in the plane except clipped lines, which are taken
            // back to lon/lat to be measured along geodesics.
            let (overlap, piece, piece_is_geographic) = match feature.extent {
                Extent::Linear => {
                    let clipped = base.areal.clip(&linear_part(&planar), false);
                    let geographic = to_geographic(&Geometry::MultiLineString(clipped), base.plane)?;
                    (geodesic_length(&geographic), geographic, true)
                }
                Extent::Discrete => {
                    let inside: Vec<geo_types::Point<f64>> = planar
                        .coords_iter()
                        .map(geo_types::Point::from)
                        .filter(|p| base.planar.intersects(p))
                        .collect();
                    (inside.len() as f64, Geometry::MultiPoint(inside.into()), false)
                }
                Extent::Areal | Extent::Degenerate => {
                    let inter = base.areal.intersection(&areal_part(&planar));
                    (inter.unsigned_area(), Geometry::MultiPolygon(inter), false)
                }
            };
            if !(overlap > 0.0) {
                continue;
            }
            let weight = (overlap / total).min(1.0);

            for (acc, attribute) in accumulators.iter_mut().zip(&spec.attributes) {
                match spec.source.value(feature, attribute) {
                    Some(v) => {
                        acc.weighted_sum += v * weight;
                        acc.overlap_sum += overlap;
                        acc.overlap_weighted_sum += v * overlap;
                        acc.contributors += 1;
                    }
                    None => acc.missing += 1,
                }
            }

            let geometry = match (spec.keep_geometry, piece_is_geographic) {
                (false, _) => None,
                (true, true) => Some(piece),
                (true, false) => Some(to_geographic(&piece, base.plane)?),
            };
            result.matches.push(JoinMatch {
                overlap: Some(overlap),
                weight: Some(weight),
                geometry,
                ..JoinMatch::plain(idx, &feature.id)
            });
        }

        if !degenerate.is_empty() {
            result.diagnostics.push(format!(
                "{}: excluded {} degenerate feature(s): {}",
                layer.dataset_id,
                degenerate.len(),
                degenerate.join(", ")
            ));
        }

        let base_km2 = base.area_m2 / SQ_METRES_PER_SQ_KM;
        for (acc, attribute) in accumulators.iter().zip(&spec.attributes) {
            if acc.missing > 0 {
                result.diagnostics.push(format!(
                    "{attribute}: {} overlapping feature(s) had no value",
                    acc.missing
                ));
            }
            for stat in &spec.statistics {
                let value = match stat {
                    Statistic::Sum => Some(acc.weighted_sum),
                    Statistic::Mean if acc.overlap_sum > 0.0 => {
                        Some(acc.overlap_weighted_sum / acc.overlap_sum)
                    }
                    Statistic::Mean => None,
                    Statistic::Density => Some(acc.weighted_sum / base_km2),
                };
                result
                    .aggregates
                    .insert(format!("{attribute}_{stat}"), value.filter(|v| v.is_finite()));
            }
        }
        Ok(())
    }
}
