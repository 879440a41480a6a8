//! Error types for the Echo analysis core.

use std::sync::Arc;

#[cfg(feature = "python")]
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
#[cfg(feature = "python")]
use pyo3::PyErr;

/// Top-level error enum for the Echo analysis core.
///
/// The enum is `Clone` so that a single-flight leader can hand its failure to
/// every waiting caller; foreign error sources are held behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EchoError {
    #[error("Catalog validation failed: {}", .issues.join("; "))]
    CatalogValidation { issues: Vec<String> },

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Dataset unavailable: {dataset_id}: {reason}")]
    DatasetUnavailable { dataset_id: String, reason: String },

    #[error("Invalid variable: {0}")]
    InvalidVariable(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Join computation error: {0}")]
    JoinComputation(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Request deadline exceeded while {0}")]
    Timeout(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("SQLite error: {0}")]
    Sqlite(Arc<rusqlite::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("YAML error: {0}")]
    Yaml(Arc<serde_yaml::Error>),
}

impl EchoError {
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EchoError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(dataset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EchoError::DatasetUnavailable {
            dataset_id: dataset_id.into(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the request itself (surfaced as client errors).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EchoError::UnknownDataset(_)
                | EchoError::InvalidVariable(_)
                | EchoError::InvalidParameter { .. }
                | EchoError::JoinComputation(_)
        )
    }

    /// Errors worth retrying locally with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EchoError::Transient(_) | EchoError::Io(_))
    }
}

impl From<std::io::Error> for EchoError {
    fn from(err: std::io::Error) -> Self {
        EchoError::Io(Arc::new(err))
    }
}

impl From<rusqlite::Error> for EchoError {
    fn from(err: rusqlite::Error) -> Self {
        EchoError::Sqlite(Arc::new(err))
    }
}

impl From<serde_json::Error> for EchoError {
    fn from(err: serde_json::Error) -> Self {
        EchoError::Json(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for EchoError {
    fn from(err: serde_yaml::Error) -> Self {
        EchoError::Yaml(Arc::new(err))
    }
}

#[cfg(feature = "python")]
impl From<EchoError> for PyErr {
    fn from(err: EchoError) -> PyErr {
        match &err {
            _ if err.is_client_error() => PyValueError::new_err(err.to_string()),
            EchoError::CatalogValidation { .. } => PyValueError::new_err(err.to_string()),
            EchoError::Timeout(_) => PyTimeoutError::new_err(err.to_string()),
            EchoError::Io(_) => PyIOError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type EchoResult<T> = Result<T, EchoError>;
