//! Shared typed models used across catalog, storage, spatial and analysis
//! layers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{EchoError, EchoResult};
use crate::spatial::crs::Crs;
use crate::spatial::geometry::{GeometryFamily, TaggedGeometry};

// ---------------------------------------------------------------------------
// Dataset descriptors
// ---------------------------------------------------------------------------

/// Declared coordinate reference system of a spatial layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CrsDeclaration {
    Declared(Crs),
    /// Taken from the artifact itself when it is loaded.
    Auto,
}

/// Closed set of dataset shapes a catalog entry can describe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DatasetKind {
    Layer {
        geometry: GeometryFamily,
        crs: CrsDeclaration,
    },
    AttributeTable {
        variables: Vec<VariableSpec>,
    },
}

impl DatasetKind {
    pub fn is_spatial(&self) -> bool {
        matches!(self, DatasetKind::Layer { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshPolicy {
    /// Fetched once; never refreshed automatically.
    Manual,
    /// Refetched once the local copy is older than `interval`.
    TimeBased { interval: Duration },
    /// Refetched when the remote version tag differs from the local one.
    ContentHash,
}

/// Integrity expectations declared in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Integrity {
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub code: String,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Immutable metadata about one dataset, as validated from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub source: String,
    pub kind: DatasetKind,
    pub refresh: RefreshPolicy,
    pub join_keys: Vec<String>,
    /// Table name inside a SQLite layer container.
    pub layer: Option<String>,
    pub integrity: Integrity,
    pub description: Option<String>,
}

impl DatasetDescriptor {
    pub fn primary_join_key(&self) -> Option<&str> {
        self.join_keys.first().map(String::as_str)
    }

    pub fn variables(&self) -> &[VariableSpec] {
        match &self.kind {
            DatasetKind::AttributeTable { variables } => variables,
            DatasetKind::Layer { .. } => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Current,
    /// Refresh failed and the caller explicitly accepted the previous copy.
    Stale,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Current => "current",
            ArtifactStatus::Stale => "stale",
        }
    }
}

/// Local materialisation of a dataset, owned by storage sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetArtifact {
    pub dataset_id: String,
    pub local_path: PathBuf,
    pub version: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub fetched_at_ms: i64,
    pub status: ArtifactStatus,
    /// Descriptor source the copy was fetched from. Empty when unknown.
    pub source: String,
    /// Checksum the descriptor pinned at fetch time.
    pub expected_sha256: Option<String>,
}

impl DatasetArtifact {
    /// Remote version plus a content prefix. Two copies with the same
    /// remote version string but different bytes get different revisions.
    pub fn revision(&self) -> String {
        let short = self.sha256.get(..12).unwrap_or(&self.sha256);
        format!("{}@{short}", self.version)
    }

    /// Whether this copy was fetched for `descriptor` as it reads now.
    pub fn matches(&self, descriptor: &DatasetDescriptor) -> bool {
        let same_pin = match (&self.expected_sha256, &descriptor.integrity.sha256) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        let content_ok = descriptor
            .integrity
            .sha256
            .as_deref()
            .map_or(true, |pin| pin.eq_ignore_ascii_case(&self.sha256));
        self.source == descriptor.source && same_pin && content_ok
    }
}

// ---------------------------------------------------------------------------
// Attribute tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Rows keyed by a geography / join key with numeric columns.
///
/// Rows are kept in key order so that tables assembled from several batches
/// or sources compare equal regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeTable {
    pub key_column: String,
    pub columns: Vec<ColumnSpec>,
    rows: BTreeMap<String, Vec<Option<f64>>>,
}

impl AttributeTable {
    pub fn new(key_column: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            key_column: key_column.into(),
            columns,
            rows: BTreeMap::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Insert or replace a row. Non-finite values are stored as `None`.
    pub fn insert_row(&mut self, key: impl Into<String>, values: Vec<Option<f64>>) -> EchoResult<()> {
        let key = key.into();
        if values.len() != self.columns.len() {
            return Err(EchoError::Format(format!(
                "row `{key}` has {} values but the table has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        let values = values
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();
        self.rows.insert(key, values);
        Ok(())
    }

    pub fn value(&self, key: &str, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows.get(key).and_then(|row| row[idx])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&str, &[Option<f64>])> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A typed parameter value as received from the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::Integer(_) => "integer",
            ParamValue::Number(_) => "number",
            ParamValue::Text(_) => "string",
            ParamValue::List(_) => "string list",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub analysis_type: String,
    pub geometry: TaggedGeometry,
    pub params: BTreeMap<String, ParamValue>,
}

impl AnalysisRequest {
    pub fn new(analysis_type: impl Into<String>, geometry: TaggedGeometry) -> Self {
        Self {
            analysis_type: analysis_type.into(),
            geometry,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// A feature returned to the caller, geometry as WKT in EPSG:4326.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFeature {
    pub layer: String,
    pub id: String,
    pub wkt: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// What an executor produces; the engine wraps it into an [`AnalysisResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisPayload {
    pub metrics: IndexMap<String, Option<f64>>,
    pub features: Vec<OutputFeature>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub analysis_type: String,
    pub executor_version: u32,
    pub fingerprint: String,
    /// Dataset id -> artifact version the result was computed against.
    pub dataset_versions: BTreeMap<String, String>,
    /// Datasets served from an explicit stale fallback.
    pub stale_datasets: Vec<String>,
    pub metrics: IndexMap<String, Option<f64>>,
    pub features: Vec<OutputFeature>,
    pub diagnostics: Vec<String>,
}
