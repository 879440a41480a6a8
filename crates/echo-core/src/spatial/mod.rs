//! Geometry handling and the spatial join engine.

pub mod bvh;
pub mod crs;
pub mod geometry;
pub mod join;
pub mod layer;

pub use crs::Crs;
pub use geometry::{GeometryFamily, TaggedGeometry};
pub use join::{AggregateSpec, JoinMatch, JoinMode, JoinResult, SpatialJoinEngine, Statistic, ValueSource};
pub use layer::{LayerFeature, PreparedLayer, RawFeature};
