//! Reading local artifacts into prepared layers and attribute tables.
//!
//! Supported artifact formats:
//!
//! * JSON feature documents: `{"crs": "EPSG:n", "features": [{"id", "wkt", "properties"}]}`
//! * SQLite layer containers (`.gpkg`, `.sqlite`, `.db`): a table named by the
//!   descriptor's `layer` with `fid`, `wkt` and `properties` (JSON) columns.
//!   A `crs: auto` layer takes its SRS from `gpkg_geometry_columns`.
//! * JSON attribute tables: `{"key_column", "columns": [{"name", "unit"}], "rows": [{"key", "values"}]}`

use std::path::Path;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::{EchoError, EchoResult};
use crate::models::{AttributeTable, ColumnSpec, CrsDeclaration, DatasetArtifact, DatasetDescriptor, DatasetKind};
use crate::singleflight::SingleFlight;
use crate::spatial::crs::Crs;
use crate::spatial::geometry::parse_wkt;
use crate::spatial::layer::{numeric_value, PreparedLayer, RawFeature};

static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());

/// Prepared layers / tables kept per process.
pub const DEFAULT_PREPARED_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactFormat {
    Json,
    Sqlite,
}

fn format_of(path: &Path) -> EchoResult<ArtifactFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" | "geojson" => Ok(ArtifactFormat::Json),
        "gpkg" | "sqlite" | "db" => Ok(ArtifactFormat::Sqlite),
        other => Err(EchoError::Format(format!(
            "unsupported artifact format `.{other}` for {}",
            path.display()
        ))),
    }
}

fn id_text(value: &Value, fallback: usize) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => fallback.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Feature documents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeatureDocument {
    #[serde(default)]
    crs: Option<String>,
    #[serde(default)]
    features: Vec<FeatureRecord>,
}

#[derive(Debug, Deserialize)]
struct FeatureRecord {
    #[serde(default)]
    id: Value,
    wkt: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

fn read_json_features(path: &Path) -> EchoResult<(Option<String>, Vec<RawFeature>)> {
    let text = std::fs::read_to_string(path)?;
    let doc: FeatureDocument = serde_json::from_str(&text)?;
    let mut features = Vec::with_capacity(doc.features.len());
    for (i, record) in doc.features.into_iter().enumerate() {
        let id = id_text(&record.id, i);
        let geometry = parse_wkt(&record.wkt)
            .map_err(|e| EchoError::Format(format!("feature `{id}` in {}: {e}", path.display())))?;
        features.push(RawFeature {
            id,
            geometry,
            properties: record.properties,
        });
    }
    Ok((doc.crs, features))
}

fn open_read_only(path: &Path) -> EchoResult<Connection> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

fn read_sqlite_features(path: &Path, table: &str) -> EchoResult<(Option<String>, Vec<RawFeature>)> {
    if !TABLE_NAME_RE.is_match(table) {
        return Err(EchoError::Format(format!("invalid layer table name `{table}`")));
    }
    let conn = open_read_only(path)?;

    // GeoPackage-style SRS registration, when present.
    let srs: Option<i64> = conn
        .query_row(
            "SELECT srs_id FROM gpkg_geometry_columns WHERE table_name = ?1;",
            [table],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or(None);

    let mut stmt = conn.prepare(&format!(
        "SELECT fid, wkt, properties FROM \"{table}\" ORDER BY fid;"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut features = Vec::new();
    for row in rows {
        let (fid, wkt, properties) = row?;
        let Some(wkt) = wkt else {
            debug!("{table}: feature {fid} has no geometry; skipped");
            continue;
        };
        let properties = match properties.as_deref() {
            Some(text) if !text.trim().is_empty() => match serde_json::from_str::<Value>(text)? {
                Value::Object(map) => map,
                _ => {
                    return Err(EchoError::Format(format!(
                        "{table}: properties of feature {fid} are not a JSON object"
                    )))
                }
            },
            _ => Map::new(),
        };
        features.push(RawFeature {
            id: fid.to_string(),
            geometry: parse_wkt(&wkt)?,
            properties,
        });
    }
    Ok((srs.map(|code| format!("EPSG:{code}")), features))
}

fn resolve_crs(
    descriptor: &DatasetDescriptor,
    declared: CrsDeclaration,
    artifact_crs: Option<&str>,
) -> EchoResult<Crs> {
    let from_artifact = match artifact_crs.map(str::parse::<Crs>) {
        Some(Ok(crs)) => Some(crs),
        Some(Err(e)) if declared == CrsDeclaration::Auto => return Err(e),
        Some(Err(_)) | None => None,
    };
    match (declared, from_artifact) {
        (CrsDeclaration::Declared(crs), Some(found)) if crs != found => {
            debug!(
                "{}: artifact reports {found} but the catalog declares {crs}; using the catalog",
                descriptor.id
            );
            Ok(crs)
        }
        (CrsDeclaration::Declared(crs), _) => Ok(crs),
        (CrsDeclaration::Auto, Some(found)) => Ok(found),
        (CrsDeclaration::Auto, None) => Err(EchoError::Format(format!(
            "{}: CRS is `auto` but the artifact does not declare one",
            descriptor.id
        ))),
    }
}

/// Read a spatial artifact and prepare it for joins.
pub fn load_layer(descriptor: &DatasetDescriptor, artifact: &DatasetArtifact) -> EchoResult<PreparedLayer> {
    let DatasetKind::Layer { crs: declared, .. } = descriptor.kind else {
        return Err(EchoError::Format(format!(
            "{} is an attribute table, not a layer",
            descriptor.id
        )));
    };
    let path = artifact.local_path.as_path();
    let (artifact_crs, features) = match format_of(path)? {
        ArtifactFormat::Json => read_json_features(path)?,
        ArtifactFormat::Sqlite => {
            let table = descriptor.layer.as_deref().unwrap_or(&descriptor.id);
            read_sqlite_features(path, table)?
        }
    };
    let crs = resolve_crs(descriptor, declared, artifact_crs.as_deref())?;
    let layer = PreparedLayer::build(&descriptor.id, &artifact.version, crs, features)?;
    info!(
        "prepared layer {} v{} ({} features, {crs})",
        descriptor.id,
        artifact.version,
        layer.len()
    );
    Ok(layer)
}

// ---------------------------------------------------------------------------
// Attribute tables
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TableDocument {
    key_column: String,
    columns: Vec<ColumnSpec>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    key: Value,
    values: Vec<Value>,
}

/// Read a JSON attribute table artifact.
pub fn load_attribute_table(descriptor: &DatasetDescriptor, artifact: &DatasetArtifact) -> EchoResult<AttributeTable> {
    if !matches!(descriptor.kind, DatasetKind::AttributeTable { .. }) {
        return Err(EchoError::Format(format!("{} is not an attribute table", descriptor.id)));
    }
    let path = artifact.local_path.as_path();
    if format_of(path)? != ArtifactFormat::Json {
        return Err(EchoError::Format(format!(
            "{}: attribute tables must be JSON documents",
            descriptor.id
        )));
    }
    let doc: TableDocument = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let mut table = AttributeTable::new(doc.key_column, doc.columns);
    for v in descriptor.variables() {
        if table.column_index(&v.code).is_none() {
            return Err(EchoError::Format(format!(
                "{}: declared variable `{}` is missing from the artifact",
                descriptor.id, v.code
            )));
        }
    }
    for (i, row) in doc.rows.into_iter().enumerate() {
        let key = id_text(&row.key, i);
        let values = row.values.iter().map(numeric_value).collect();
        table.insert_row(key.trim(), values)?;
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Version-keyed cache
// ---------------------------------------------------------------------------

/// Prepared values keyed by (dataset id, version), least recently used
/// evicted first. Building a missing entry is single-flight.
pub struct VersionedCache<V> {
    entries: Mutex<IndexMap<(String, String), Arc<V>>>,
    capacity: usize,
    flights: SingleFlight<(String, String), Arc<V>>,
}

impl<V> VersionedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
            flights: SingleFlight::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn lookup(&self, key: &(String, String)) -> Option<Arc<V>> {
        let mut entries = self.entries.lock();
        let idx = entries.get_index_of(key)?;
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        entries.get(key).cloned()
    }

    /// Return the prepared value for `(dataset_id, version)`, building it
    /// with `build` on a miss. Older versions of the dataset are dropped.
    pub fn get_or_build<F>(&self, dataset_id: &str, version: &str, build: F) -> EchoResult<Arc<V>>
    where
        F: FnOnce() -> EchoResult<V>,
    {
        let key = (dataset_id.to_string(), version.to_string());
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let (value, _) = self.flights.run(&key, None, "layer preparation", || {
            if let Some(hit) = self.lookup(&key) {
                return Ok(hit);
            }
            let value = Arc::new(build()?);
            let mut entries = self.entries.lock();
            entries.retain(|(id, _), _| id != dataset_id);
            entries.insert(key.clone(), Arc::clone(&value));
            while entries.len() > self.capacity {
                entries.shift_remove_index(0);
            }
            Ok(value)
        })?;
        Ok(value)
    }

    /// Drop every version of `dataset_id`.
    pub fn purge_dataset(&self, dataset_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _), _| id != dataset_id);
        before - entries.len()
    }
}
