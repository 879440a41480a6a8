//! Reference layers prepared for repeated joins.
//!
//! A prepared layer holds every feature in geographic coordinates plus a
//! bulk-loaded index over their bounding boxes. It is built once per
//! (dataset, version) and shared read-only by concurrent requests.

use geo_types::Geometry;
use serde_json::{Map, Value};

use crate::errors::EchoResult;
use crate::spatial::bvh::{BBox, Bvh, DEFAULT_NODE_CAPACITY};
use crate::spatial::crs::Crs;
use crate::spatial::geometry::{to_geographic, Extent, GeometryFamily};

/// A feature as read from an artifact, in the artifact's own CRS.
#[derive(Debug, Clone)]
pub struct RawFeature {
    pub id: String,
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

/// A feature in geographic coordinates.
#[derive(Debug, Clone)]
pub struct LayerFeature {
    pub id: String,
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
    pub bbox: BBox,
    /// Measured on the source coordinates before reprojection.
    pub extent: Extent,
}

impl LayerFeature {
    /// Numeric value of a property. Numeric strings are accepted since
    /// several sources store codes and counts as text.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        numeric_value(self.properties.get(name)?)
    }

    /// Property rendered as a join key.
    pub fn key(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

pub fn numeric_value(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

#[derive(Debug)]
pub struct PreparedLayer {
    pub dataset_id: String,
    pub version: String,
    pub source_crs: Crs,
    pub family: GeometryFamily,
    features: Vec<LayerFeature>,
    index: Bvh,
    /// Ids of features dropped because they have no extent (empty geometry).
    pub skipped: Vec<String>,
}

impl PreparedLayer {
    pub fn build(
        dataset_id: impl Into<String>,
        version: impl Into<String>,
        source_crs: Crs,
        raw: Vec<RawFeature>,
    ) -> EchoResult<Self> {
        let mut features = Vec::with_capacity(raw.len());
        let mut skipped = Vec::new();
        for feature in raw {
            let extent = Extent::of(&feature.geometry);
            let geometry = to_geographic(&feature.geometry, source_crs)?;
            match BBox::from_geometry(&geometry) {
                Some(bbox) => features.push(LayerFeature {
                    id: feature.id,
                    geometry,
                    properties: feature.properties,
                    bbox,
                    extent,
                }),
                None => skipped.push(feature.id),
            }
        }

        let family = {
            let mut families = features.iter().map(|f| GeometryFamily::of(&f.geometry));
            match families.next() {
                Some(first) if families.all(|f| f == first) => first,
                Some(_) => GeometryFamily::Mixed,
                None => GeometryFamily::Polygon,
            }
        };
        let entries = features.iter().enumerate().map(|(i, f)| (i, f.bbox)).collect();
        let index = Bvh::build(entries, DEFAULT_NODE_CAPACITY);

        Ok(Self {
            dataset_id: dataset_id.into(),
            version: version.into(),
            source_crs,
            family,
            features,
            index,
            skipped,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[LayerFeature] {
        &self.features
    }

    pub fn feature(&self, idx: usize) -> &LayerFeature {
        &self.features[idx]
    }

    pub fn bounds(&self) -> Option<BBox> {
        self.index.bounds()
    }

    /// Indices of features whose geographic bbox meets `window`.
    pub fn candidates(&self, window: &BBox) -> Vec<usize> {
        self.index.query(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::geometry::{parse_wkt, point};

    fn raw(id: &str, wkt: &str) -> RawFeature {
        RawFeature {
            id: id.to_string(),
            geometry: parse_wkt(wkt).unwrap(),
            properties: Map::new(),
        }
    }

    #[test]
    fn test_build_reprojects_and_indexes() {
        let layer = PreparedLayer::build(
            "stops",
            "v1",
            Crs::WebMercator,
            vec![
                RawFeature {
                    id: "a".into(),
                    geometry: point(0.0, 0.0),
                    properties: Map::new(),
                },
                RawFeature {
                    id: "b".into(),
                    geometry: point(111_319.490_793, 0.0),
                    properties: Map::new(),
                },
            ],
        )
        .unwrap();
        assert_eq!(layer.len(), 2);
        assert_eq!(layer.family, GeometryFamily::Point);
        let near_one_degree = layer.candidates(&BBox::new(0.5, -0.5, 1.5, 0.5));
        assert_eq!(near_one_degree, vec![1]);
        assert_eq!(layer.feature(1).id, "b");
    }

    #[test]
    fn test_empty_geometries_are_skipped() {
        let layer = PreparedLayer::build(
            "zones",
            "v1",
            Crs::WGS84,
            vec![
                raw("empty", "GEOMETRYCOLLECTION EMPTY"),
                raw("z1", "POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))"),
            ],
        )
        .unwrap();
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.skipped, vec!["empty".to_string()]);
        assert_eq!(layer.family, GeometryFamily::Polygon);
    }

    #[test]
    fn test_flat_source_polygon_stays_degenerate_after_reprojection() {
        let layer = PreparedLayer::build(
            "parcels",
            "v1",
            Crs::from_epsg(7855).unwrap(),
            vec![
                raw("flat", "POLYGON((320500 5812500, 320600 5812500, 320700 5812500, 320500 5812500))"),
                raw("lot", "POLYGON((320100 5812100, 320300 5812100, 320300 5812300, 320100 5812100))"),
            ],
        )
        .unwrap();
        assert_eq!(layer.feature(0).extent, Extent::Degenerate);
        assert_eq!(layer.feature(1).extent, Extent::Areal);
    }

    #[test]
    fn test_numeric_and_key_properties() {
        let mut properties = Map::new();
        properties.insert("pop".into(), Value::String(" 12.5 ".into()));
        properties.insert("code".into(), Value::from(20601));
        properties.insert("bad".into(), Value::String("n/a".into()));
        let f = LayerFeature {
            id: "x".into(),
            geometry: point(0.0, 0.0),
            properties,
            bbox: BBox::new(0.0, 0.0, 0.0, 0.0),
            extent: Extent::Discrete,
        };
        assert_eq!(f.numeric("pop"), Some(12.5));
        assert_eq!(f.numeric("bad"), None);
        assert_eq!(f.key("code").as_deref(), Some("20601"));
    }
}
