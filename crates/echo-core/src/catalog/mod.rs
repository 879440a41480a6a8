//! Dataset catalog: parsing, validation and the live registry.
//!
//! A [`CatalogSnapshot`] is immutable once built. The [`CatalogRegistry`]
//! swaps whole snapshots on reload so work in progress keeps the snapshot it
//! started with.

pub mod parse;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::errors::{EchoError, EchoResult};
use crate::models::{DatasetDescriptor, VariableSpec};

pub use parse::parse_catalog;
pub use registry::CatalogRegistry;

/// Statistical service settings declared by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsCatalog {
    /// Data release the service answers for; part of every fingerprint.
    pub vintage: String,
    /// Service variables requests may ask for, keyed by code.
    pub variables: IndexMap<String, VariableSpec>,
}

impl Default for StatisticsCatalog {
    fn default() -> Self {
        Self {
            vintage: "latest".to_string(),
            variables: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub generation: u64,
    /// SHA-256 of the catalog text the snapshot was parsed from.
    pub digest: String,
    pub datasets: IndexMap<String, Arc<DatasetDescriptor>>,
    pub statistics: StatisticsCatalog,
}

impl CatalogSnapshot {
    pub fn resolve(&self, id: &str) -> EchoResult<Arc<DatasetDescriptor>> {
        self.datasets
            .get(id)
            .cloned()
            .ok_or_else(|| EchoError::UnknownDataset(id.to_string()))
    }

    /// The attribute table dataset that declares `variable`, if any.
    pub fn table_for_variable(&self, variable: &str) -> Option<Arc<DatasetDescriptor>> {
        self.datasets
            .values()
            .find(|d| d.variables().iter().any(|v| v.code == variable))
            .cloned()
    }

    pub fn is_service_variable(&self, variable: &str) -> bool {
        self.statistics.variables.contains_key(variable)
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}

/// Where catalog text comes from.
#[derive(Debug, Clone)]
pub enum CatalogSource {
    Path(PathBuf),
    Inline(String),
}

impl CatalogSource {
    pub fn read(&self) -> EchoResult<String> {
        match self {
            CatalogSource::Path(path) => std::fs::read_to_string(path).map_err(|e| {
                EchoError::CatalogValidation {
                    issues: vec![format!("cannot read catalog {}: {e}", path.display())],
                }
            }),
            CatalogSource::Inline(text) => Ok(text.clone()),
        }
    }
}

/// Read and validate a catalog, producing generation `generation`.
pub fn load(source: &CatalogSource, generation: u64) -> EchoResult<CatalogSnapshot> {
    parse_catalog(&source.read()?, generation)
}
