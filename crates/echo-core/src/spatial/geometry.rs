//! Tagged geometries, WKT conversion, planar and geodesic measures.

use geo::{
    Area, BoundingRect, Centroid, Closest, ClosestPoint, CoordsIter, Distance, Euclidean, Geodesic,
    Length, MapCoords,
};
use geo_types::{Coord, Geometry, LineString, MultiLineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};
use wkt::ToWkt;

use crate::errors::{EchoError, EchoResult};
use crate::spatial::crs::Crs;

/// A geometry with its coordinate reference system.
///
/// `crs` is optional only so that untagged input can be represented and
/// rejected by the join engine; nothing guesses a missing tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedGeometry {
    pub geometry: Geometry<f64>,
    pub crs: Option<Crs>,
}

impl TaggedGeometry {
    pub fn new(geometry: Geometry<f64>, crs: Crs) -> Self {
        Self {
            geometry,
            crs: Some(crs),
        }
    }

    pub fn untagged(geometry: Geometry<f64>) -> Self {
        Self {
            geometry,
            crs: None,
        }
    }

    /// Parse WKT with an optional `EPSG:n` tag.
    pub fn from_wkt(wkt: &str, crs: Option<&str>) -> EchoResult<Self> {
        let geometry = parse_wkt(wkt)?;
        let crs = crs.map(str::parse::<Crs>).transpose()?;
        Ok(Self { geometry, crs })
    }

    pub fn require_crs(&self) -> EchoResult<Crs> {
        self.crs.ok_or_else(|| {
            EchoError::JoinComputation(
                "geometry has no coordinate reference system tag".to_string(),
            )
        })
    }

    /// Reproject into geographic lon/lat.
    pub fn to_geographic(&self) -> EchoResult<Geometry<f64>> {
        let crs = self.require_crs()?;
        to_geographic(&self.geometry, crs)
    }

    /// Canonical text used in cache fingerprints.
    pub fn canonical_text(&self) -> String {
        let tag = self
            .crs
            .map(|c| c.to_string())
            .unwrap_or_else(|| "untagged".to_string());
        format!("{tag};{}", to_wkt(&self.geometry))
    }
}

/// Broad dimensional family of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryFamily {
    Point,
    Line,
    Polygon,
    Mixed,
}

impl GeometryFamily {
    pub fn of(geom: &Geometry<f64>) -> Self {
        match geom {
            Geometry::Point(_) | Geometry::MultiPoint(_) => GeometryFamily::Point,
            Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
                GeometryFamily::Line
            }
            Geometry::Polygon(_)
            | Geometry::MultiPolygon(_)
            | Geometry::Rect(_)
            | Geometry::Triangle(_) => GeometryFamily::Polygon,
            Geometry::GeometryCollection(gc) => {
                let mut families = gc.iter().map(GeometryFamily::of);
                match families.next() {
                    Some(first) if families.all(|f| f == first) => first,
                    Some(_) => GeometryFamily::Mixed,
                    None => GeometryFamily::Mixed,
                }
            }
        }
    }
}

pub fn parse_wkt(wkt: &str) -> EchoResult<Geometry<f64>> {
    use std::str::FromStr;
    let parsed = wkt::Wkt::<f64>::from_str(wkt)
        .map_err(|e| EchoError::Format(format!("WKT parse error: {e}")))?;
    Geometry::try_from(parsed).map_err(|e| EchoError::Format(format!("WKT conversion error: {e:?}")))
}

pub fn to_wkt(geom: &Geometry<f64>) -> String {
    geom.wkt_string()
}

// ---------------------------------------------------------------------------
// Reprojection
// ---------------------------------------------------------------------------

pub fn to_geographic(geom: &Geometry<f64>, from: Crs) -> EchoResult<Geometry<f64>> {
    if from.is_geographic() {
        return Ok(geom.clone());
    }
    geom.try_map_coords(|c| from.to_geographic(c))
}

pub fn from_geographic(geom: &Geometry<f64>, to: Crs) -> EchoResult<Geometry<f64>> {
    if to.is_geographic() {
        return Ok(geom.clone());
    }
    geom.try_map_coords(|c| to.from_geographic(c))
}

/// Geographic centroid used to centre the equal-area plane for a request.
pub fn geographic_anchor(geographic: &Geometry<f64>) -> EchoResult<Coord<f64>> {
    if let Some(c) = geographic.centroid() {
        return Ok(c.0);
    }
    // Degenerate shapes without a centroid fall back to the bbox centre.
    geographic
        .bounding_rect()
        .map(|r| r.center())
        .ok_or_else(|| EchoError::JoinComputation("geometry is empty".to_string()))
}

// ---------------------------------------------------------------------------
// Planar measures (valid only on the equal-area plane)
// ---------------------------------------------------------------------------

/// Areal part of a geometry as a multipolygon (empty for points and lines).
pub fn areal_part(geom: &Geometry<f64>) -> MultiPolygon<f64> {
    let mut polys: Vec<Polygon<f64>> = Vec::new();
    collect_polygons(geom, &mut polys);
    MultiPolygon::new(polys)
}

fn collect_polygons(geom: &Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geom {
        Geometry::Polygon(p) => out.push(p.clone()),
        Geometry::MultiPolygon(mp) => out.extend(mp.0.iter().cloned()),
        Geometry::Rect(r) => out.push(r.to_polygon()),
        Geometry::Triangle(t) => out.push(t.to_polygon()),
        Geometry::GeometryCollection(gc) => gc.iter().for_each(|g| collect_polygons(g, out)),
        _ => {}
    }
}

/// Linear part of a geometry as a multilinestring.
pub fn linear_part(geom: &Geometry<f64>) -> MultiLineString<f64> {
    let mut lines: Vec<LineString<f64>> = Vec::new();
    collect_lines(geom, &mut lines);
    MultiLineString::new(lines)
}

fn collect_lines(geom: &Geometry<f64>, out: &mut Vec<LineString<f64>>) {
    match geom {
        Geometry::Line(l) => out.push(LineString::from(vec![l.start, l.end])),
        Geometry::LineString(ls) => out.push(ls.clone()),
        Geometry::MultiLineString(mls) => out.extend(mls.0.iter().cloned()),
        Geometry::GeometryCollection(gc) => gc.iter().for_each(|g| collect_lines(g, out)),
        _ => {}
    }
}

pub fn planar_area(geom: &Geometry<f64>) -> f64 {
    areal_part(geom).unsigned_area()
}

pub fn planar_length(geom: &Geometry<f64>) -> f64 {
    linear_part(geom).length::<Euclidean>()
}

/// Minimum planar distance between two geometries; zero when they touch or
/// overlap.
pub fn planar_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    Euclidean::distance(a, b)
}

/// Closest point on `target` to each vertex of `from`, keeping the nearest
/// pair as `(on_from, on_target)`.
fn closest_to_vertices(
    from: &Geometry<f64>,
    target: &Geometry<f64>,
    best: &mut Option<(f64, Coord<f64>, Coord<f64>)>,
) {
    for vertex in from.coords_iter() {
        let p = Point::from(vertex);
        let hit = match target.closest_point(&p) {
            Closest::Intersection(q) | Closest::SinglePoint(q) => q,
            Closest::Indeterminate => continue,
        };
        let d = Euclidean::distance(p, hit);
        if best.map_or(true, |(current, _, _)| d < current) {
            *best = Some((d, vertex, hit.0));
        }
    }
}

/// Pair of planar points realising the minimum distance between two
/// disjoint geometries. `None` when either geometry is empty.
pub fn closest_pair(a: &Geometry<f64>, b: &Geometry<f64>) -> Option<(Coord<f64>, Coord<f64>)> {
    let mut best = None;
    closest_to_vertices(a, b, &mut best);
    let forward = best;
    best = None;
    closest_to_vertices(b, a, &mut best);
    match (forward, best) {
        (Some((d1, p, q)), Some((d2, _, _))) if d1 <= d2 => Some((p, q)),
        (Some(_), Some((_, q, p))) => Some((p, q)),
        (Some((_, p, q)), None) => Some((p, q)),
        (None, Some((_, q, p))) => Some((p, q)),
        (None, None) => None,
    }
}

/// Ellipsoidal distance in metres between two geometries given on `plane`.
/// The planar closest pair is mapped back to lon/lat and measured along
/// the geodesic; zero when the geometries touch or overlap.
pub fn geodesic_distance(a: &Geometry<f64>, b: &Geometry<f64>, plane: Crs) -> EchoResult<f64> {
    if planar_distance(a, b) == 0.0 {
        return Ok(0.0);
    }
    let Some((p, q)) = closest_pair(a, b) else {
        return Ok(f64::INFINITY);
    };
    let (p, q) = (plane.to_geographic(p)?, plane.to_geographic(q)?);
    Ok(Geodesic::distance(Point::from(p), Point::from(q)))
}

/// Length in metres of the linear part of a lon/lat geometry, measured
/// along geodesics.
pub fn geodesic_length(geographic: &Geometry<f64>) -> f64 {
    linear_part(geographic).length::<Geodesic>()
}

/// Polygons whose area is below this fraction of their squared perimeter
/// are treated as flat.
const SLIVER_RATIO: f64 = 1e-12;

/// What a feature contributes to an overlay. Decided on the source
/// coordinates, before reprojection bends any edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Areal,
    Linear,
    Discrete,
    Degenerate,
}

impl Extent {
    pub fn of(source: &Geometry<f64>) -> Self {
        let areal = areal_part(source);
        let perimeter: f64 = areal
            .iter()
            .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()))
            .map(|ring| ring.length::<Euclidean>())
            .sum();
        if areal.unsigned_area() > SLIVER_RATIO * perimeter * perimeter {
            return Extent::Areal;
        }
        match GeometryFamily::of(source) {
            GeometryFamily::Polygon => Extent::Degenerate,
            _ if planar_length(source) > 0.0 => Extent::Linear,
            GeometryFamily::Point if source.coords_count() > 0 => Extent::Discrete,
            _ => Extent::Degenerate,
        }
    }
}

pub fn point(x: f64, y: f64) -> Geometry<f64> {
    Geometry::Point(Point::new(x, y))
}
