//! Catalog document parsing and eager validation.
//!
//! The YAML document is first read into loosely-typed `Raw*` structs, then
//! every entry is validated into a closed [`DatasetDescriptor`] variant. All
//! problems found are reported together.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::catalog::{CatalogSnapshot, StatisticsCatalog};
use crate::errors::{EchoError, EchoResult};
use crate::models::{
    CrsDeclaration, DatasetDescriptor, DatasetKind, Integrity, RefreshPolicy, VariableSpec,
};
use crate::spatial::crs::Crs;
use crate::spatial::geometry::GeometryFamily;

static DATASET_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_\-]{0,63}$").unwrap());

static SOURCE_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(file|https?|s3|gs|az)://\S+$").unwrap());

static VARIABLE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.]{0,127}$").unwrap());

static SHA256_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap());

/// Catalog document versions this parser understands.
const SUPPORTED_CATALOG_VERSION: u32 = 1;

pub fn is_valid_variable_code(code: &str) -> bool {
    VARIABLE_CODE_RE.is_match(code)
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    statistics: Option<RawStatistics>,
    #[serde(default)]
    datasets: Vec<RawDataset>,
}

#[derive(Debug, Deserialize)]
struct RawStatistics {
    #[serde(default)]
    vintage: Option<String>,
    #[serde(default)]
    variables: Vec<RawVariable>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVariable {
    Code(String),
    Spec(VariableSpec),
}

impl RawVariable {
    fn into_spec(self) -> VariableSpec {
        match self {
            RawVariable::Code(code) => VariableSpec { code, unit: None },
            RawVariable::Spec(spec) => spec,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    id: Option<String>,
    source: Option<String>,
    kind: Option<String>,
    crs: Option<String>,
    #[serde(default)]
    join_key: Option<String>,
    #[serde(default)]
    join_keys: Vec<String>,
    refresh: Option<String>,
    #[serde(default)]
    refresh_interval_secs: Option<u64>,
    #[serde(default)]
    layer: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    variables: Vec<RawVariable>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_kind(raw: &str) -> Option<(bool, Option<GeometryFamily>)> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "point_layer" | "points" => Some((true, Some(GeometryFamily::Point))),
        "line_layer" | "lines" => Some((true, Some(GeometryFamily::Line))),
        "polygon_layer" | "polygons" => Some((true, Some(GeometryFamily::Polygon))),
        "attribute_table" | "table" => Some((false, None)),
        _ => None,
    }
}

fn parse_refresh(
    label: &str,
    raw: Option<&str>,
    interval_secs: Option<u64>,
    issues: &mut Vec<String>,
) -> Option<RefreshPolicy> {
    let Some(raw) = raw else {
        issues.push(format!("{label}: missing required field `refresh`"));
        return None;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "manual" => Some(RefreshPolicy::Manual),
        "content_hash" | "content-hash" | "etag" => Some(RefreshPolicy::ContentHash),
        "time" | "time_based" | "time-based" => match interval_secs {
            Some(secs) if secs > 0 => Some(RefreshPolicy::TimeBased {
                interval: Duration::from_secs(secs),
            }),
            _ => {
                issues.push(format!(
                    "{label}: time-based refresh requires a positive `refresh_interval_secs`"
                ));
                None
            }
        },
        other => {
            issues.push(format!("{label}: unsupported refresh policy `{other}`"));
            None
        }
    }
}

fn validate_dataset(index: usize, raw: RawDataset, issues: &mut Vec<String>) -> Option<DatasetDescriptor> {
    let before = issues.len();
    let label = match raw.id.as_deref() {
        Some(id) => format!("dataset `{id}`"),
        None => format!("dataset #{index}"),
    };

    let id = match raw.id {
        Some(id) if DATASET_ID_RE.is_match(&id) => Some(id),
        Some(id) => {
            issues.push(format!(
                "{label}: identifier `{id}` must match [a-z][a-z0-9_-]*"
            ));
            None
        }
        None => {
            issues.push(format!("{label}: missing required field `id`"));
            None
        }
    };

    let source = match raw.source {
        Some(s) if SOURCE_URI_RE.is_match(s.trim()) => Some(s.trim().to_string()),
        Some(s) => {
            issues.push(format!("{label}: malformed source location `{s}`"));
            None
        }
        None => {
            issues.push(format!("{label}: missing required field `source`"));
            None
        }
    };

    let refresh = parse_refresh(&label, raw.refresh.as_deref(), raw.refresh_interval_secs, issues);

    let mut join_keys: Vec<String> = raw.join_key.into_iter().collect();
    for key in raw.join_keys {
        if !join_keys.contains(&key) {
            join_keys.push(key);
        }
    }
    if join_keys.iter().any(|k| k.trim().is_empty()) {
        issues.push(format!("{label}: join keys must not be blank"));
    }

    let kind = match raw.kind.as_deref().map(parse_kind) {
        None => {
            issues.push(format!("{label}: missing required field `kind`"));
            None
        }
        Some(None) => {
            issues.push(format!(
                "{label}: unsupported kind `{}`",
                raw.kind.as_deref().unwrap_or_default()
            ));
            None
        }
        Some(Some((true, Some(geometry)))) => {
            let crs = match raw.crs.as_deref().map(str::trim) {
                None | Some("") => {
                    issues.push(format!(
                        "{label}: spatial datasets must declare `crs` (an EPSG code or `auto`)"
                    ));
                    None
                }
                Some(c) if c.eq_ignore_ascii_case("auto") => Some(CrsDeclaration::Auto),
                Some(c) => match c.parse::<Crs>() {
                    Ok(crs) => Some(CrsDeclaration::Declared(crs)),
                    Err(e) => {
                        issues.push(format!("{label}: {e}"));
                        None
                    }
                },
            };
            crs.map(|crs| DatasetKind::Layer { geometry, crs })
        }
        Some(Some(_)) => {
            let variables: Vec<VariableSpec> =
                raw.variables.into_iter().map(RawVariable::into_spec).collect();
            if variables.is_empty() {
                issues.push(format!(
                    "{label}: attribute tables must declare at least one variable"
                ));
            }
            for v in &variables {
                if !is_valid_variable_code(&v.code) {
                    issues.push(format!("{label}: invalid variable code `{}`", v.code));
                }
            }
            if join_keys.is_empty() {
                issues.push(format!("{label}: attribute tables must declare a join key"));
            }
            Some(DatasetKind::AttributeTable { variables })
        }
    };

    if let Some(sha) = raw.sha256.as_deref() {
        if !SHA256_RE.is_match(sha) {
            issues.push(format!("{label}: `sha256` must be 64 hex characters"));
        }
    }

    if issues.len() > before {
        return None;
    }
    Some(DatasetDescriptor {
        id: id?,
        source: source?,
        kind: kind?,
        refresh: refresh?,
        join_keys,
        layer: raw.layer.filter(|l| !l.trim().is_empty()),
        integrity: Integrity {
            sha256: raw.sha256.map(|s| s.to_ascii_lowercase()),
            size_bytes: raw.size_bytes,
        },
        description: raw.description,
    })
}

/// Parse and validate catalog text into a snapshot with the given generation.
pub fn parse_catalog(text: &str, generation: u64) -> EchoResult<CatalogSnapshot> {
    let raw: RawCatalog = serde_yaml::from_str(text).map_err(|e| EchoError::CatalogValidation {
        issues: vec![format!("catalog is not valid YAML: {e}")],
    })?;

    let mut issues = Vec::new();
    if let Some(version) = raw.version {
        if version != SUPPORTED_CATALOG_VERSION {
            issues.push(format!("unsupported catalog version {version}"));
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut datasets: IndexMap<String, Arc<DatasetDescriptor>> = IndexMap::new();
    for (index, entry) in raw.datasets.into_iter().enumerate() {
        if let Some(id) = entry.id.as_deref() {
            if !seen.insert(id.to_string()) {
                issues.push(format!("duplicate dataset identifier `{id}`"));
                continue;
            }
        }
        if let Some(descriptor) = validate_dataset(index, entry, &mut issues) {
            datasets.insert(descriptor.id.clone(), Arc::new(descriptor));
        }
    }

    let statistics = match raw.statistics {
        Some(stats) => {
            let mut variables: IndexMap<String, VariableSpec> = IndexMap::new();
            for var in stats.variables.into_iter().map(RawVariable::into_spec) {
                if !is_valid_variable_code(&var.code) {
                    issues.push(format!("statistics: invalid variable code `{}`", var.code));
                } else if variables.contains_key(&var.code) {
                    issues.push(format!("statistics: duplicate variable `{}`", var.code));
                } else {
                    variables.insert(var.code.clone(), var);
                }
            }
            StatisticsCatalog {
                vintage: stats.vintage.unwrap_or_else(|| "latest".to_string()),
                variables,
            }
        }
        None => StatisticsCatalog::default(),
    };

    if !issues.is_empty() {
        return Err(EchoError::CatalogValidation { issues });
    }

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    Ok(CatalogSnapshot {
        generation,
        digest: format!("{:x}", hasher.finalize()),
        datasets,
        statistics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: 1
statistics:
  vintage: "2021"
  variables:
    - code: population
      unit: persons
    - median_income
datasets:
  - id: parcels
    kind: polygon_layer
    source: file:///data/parcels.json
    crs: EPSG:7855
    join_key: sa1_code
    refresh: content_hash
  - id: pois
    kind: point_layer
    source: https://storage.example.org/raw-master/master.gpkg
    layer: pois
    crs: auto
    refresh: time
    refresh_interval_secs: 3600
  - id: census
    kind: attribute_table
    source: s3://bucket/census/clean/sa1.json
    join_key: sa1_code
    refresh: manual
    variables: [dwellings, { code: households, unit: count }]
"#;

    fn issues_of(text: &str) -> Vec<String> {
        match parse_catalog(text, 1) {
            Err(EchoError::CatalogValidation { issues }) => issues,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_catalog_resolves_every_dataset() {
        let snapshot = parse_catalog(VALID, 3).unwrap();
        assert_eq!(snapshot.generation, 3);
        assert_eq!(snapshot.datasets.len(), 3);
        for id in ["parcels", "pois", "census"] {
            assert_eq!(snapshot.resolve(id).unwrap().id, id);
        }
        let pois = snapshot.resolve("pois").unwrap();
        assert_eq!(pois.layer.as_deref(), Some("pois"));
        assert_eq!(
            pois.refresh,
            RefreshPolicy::TimeBased {
                interval: Duration::from_secs(3600)
            }
        );
        assert!(matches!(
            pois.kind,
            DatasetKind::Layer {
                crs: CrsDeclaration::Auto,
                ..
            }
        ));
        assert_eq!(snapshot.statistics.vintage, "2021");
        assert!(snapshot.statistics.variables.contains_key("median_income"));
        assert_eq!(snapshot.resolve("census").unwrap().variables().len(), 2);
        assert_eq!(snapshot.digest.len(), 64);
    }

    #[test]
    fn test_snapshot_serializes_shared_descriptors() {
        let snapshot = parse_catalog(VALID, 2).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["generation"], 2);
        assert_eq!(json["datasets"]["parcels"]["source"], "file:///data/parcels.json");
        assert_eq!(json["datasets"]["census"]["join_keys"][0], "sa1_code");
        assert_eq!(json["statistics"]["vintage"], "2021");
    }

    #[test]
    fn test_unknown_dataset() {
        let snapshot = parse_catalog(VALID, 1).unwrap();
        assert!(matches!(
            snapshot.resolve("rivers"),
            Err(EchoError::UnknownDataset(id)) if id == "rivers"
        ));
    }

    #[test]
    fn test_duplicate_identifiers_fail() {
        let text = r#"
datasets:
  - { id: zones, kind: polygon_layer, source: "file:///a.json", crs: EPSG:4326, refresh: manual }
  - { id: zones, kind: polygon_layer, source: "file:///b.json", crs: EPSG:4326, refresh: manual }
"#;
        let issues = issues_of(text);
        assert!(issues.iter().any(|i| i.contains("duplicate dataset identifier `zones`")));
    }

    #[test]
    fn test_missing_fields_and_bad_policy_are_all_reported() {
        let text = r#"
datasets:
  - { id: a, kind: polygon_layer, crs: EPSG:4326, refresh: manual }
  - { id: b, kind: point_layer, source: "file:///b.json", crs: EPSG:4326, refresh: hourly }
  - { id: c, kind: raster, source: "file:///c.tif", refresh: manual }
  - { id: d, kind: line_layer, source: "not a uri", refresh: manual }
"#;
        let issues = issues_of(text);
        assert!(issues.iter().any(|i| i.contains("`a`: missing required field `source`")));
        assert!(issues.iter().any(|i| i.contains("unsupported refresh policy `hourly`")));
        assert!(issues.iter().any(|i| i.contains("unsupported kind `raster`")));
        assert!(issues.iter().any(|i| i.contains("malformed source location")));
        assert!(issues.iter().any(|i| i.contains("`d`: spatial datasets must declare `crs`")));
    }

    #[test]
    fn test_time_refresh_needs_interval() {
        let text = r#"
datasets:
  - { id: a, kind: point_layer, source: "file:///a.json", crs: EPSG:4326, refresh: time }
"#;
        assert!(issues_of(text)[0].contains("refresh_interval_secs"));
    }

    #[test]
    fn test_attribute_table_needs_variables_and_key() {
        let text = r#"
datasets:
  - { id: t, kind: attribute_table, source: "file:///t.json", refresh: manual }
"#;
        let issues = issues_of(text);
        assert!(issues.iter().any(|i| i.contains("at least one variable")));
        assert!(issues.iter().any(|i| i.contains("join key")));
    }

    #[test]
    fn test_malformed_yaml_is_a_validation_error() {
        let issues = issues_of("datasets: [ { id: a ");
        assert!(issues[0].contains("not valid YAML"));
    }
}
