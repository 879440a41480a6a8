//! Engine configuration with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{EchoError, EchoResult};
use crate::guards::{
    clamp_cache_entries, clamp_int, DEFAULT_RESULT_CACHE_ENTRIES, DEFAULT_RESULT_CACHE_TTL_SECS,
    MAX_FETCH_ATTEMPTS, MAX_STATS_CACHE_ENTRIES,
};
use crate::observability::LogFormat;
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS};
use crate::stats::client::{DEFAULT_STATS_CACHE_ENTRIES, DEFAULT_STATS_CACHE_TTL};
use crate::store::layers::DEFAULT_PREPARED_CAPACITY;

pub const DEFAULT_CATALOG_PATH: &str = "catalog.yaml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const MANIFEST_FILE_NAME: &str = "manifest.db";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub catalog_path: PathBuf,
    pub data_dir: PathBuf,
    /// Defaults to `manifest.db` inside `data_dir`.
    pub manifest_path: Option<PathBuf>,
    pub fetch_max_attempts: u32,
    pub fetch_backoff: Duration,
    /// Serve the previous copy of a dataset when a refresh fails.
    pub allow_stale: bool,
    pub stats_cache_ttl: Duration,
    pub stats_cache_entries: usize,
    pub result_cache_entries: usize,
    pub result_cache_ttl: Duration,
    pub prepared_layer_capacity: usize,
    /// Applied to requests that arrive without their own deadline.
    pub request_timeout: Option<Duration>,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            manifest_path: None,
            fetch_max_attempts: DEFAULT_MAX_ATTEMPTS,
            fetch_backoff: DEFAULT_BACKOFF_BASE,
            allow_stale: false,
            stats_cache_ttl: DEFAULT_STATS_CACHE_TTL,
            stats_cache_entries: DEFAULT_STATS_CACHE_ENTRIES,
            result_cache_entries: DEFAULT_RESULT_CACHE_ENTRIES as usize,
            result_cache_ttl: Duration::from_secs(DEFAULT_RESULT_CACHE_TTL_SECS as u64),
            prepared_layer_capacity: DEFAULT_PREPARED_CAPACITY,
            request_timeout: None,
            log_format: LogFormat::Pretty,
        }
    }
}

/// `0|false|no|off` are false; anything else is true.
fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

fn parse_int(name: &str, value: &str) -> EchoResult<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| EchoError::invalid_parameter(name, format!("`{value}` is not an integer")))
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> EchoResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> EchoResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MASTER_CATALOG_PATH") {
            config.catalog_path = PathBuf::from(v.trim());
        }
        if let Some(v) = get("LOCAL_DATA_BASE") {
            config.data_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("ECHO_MANIFEST_PATH") {
            config.manifest_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("ECHO_FETCH_MAX_ATTEMPTS") {
            let n = parse_int("ECHO_FETCH_MAX_ATTEMPTS", &v)?;
            config.fetch_max_attempts = clamp_int(n, 1, MAX_FETCH_ATTEMPTS) as u32;
        }
        if let Some(v) = get("ECHO_FETCH_BACKOFF_MS") {
            let ms = parse_int("ECHO_FETCH_BACKOFF_MS", &v)?;
            config.fetch_backoff = Duration::from_millis(ms.max(0) as u64);
        }
        if let Some(v) = get("ECHO_ALLOW_STALE") {
            config.allow_stale = parse_flag(&v);
        }
        if let Some(v) = get("ECHO_STATS_CACHE_TTL_SECS") {
            let secs = parse_int("ECHO_STATS_CACHE_TTL_SECS", &v)?;
            config.stats_cache_ttl = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(v) = get("ECHO_STATS_CACHE_ENTRIES") {
            let n = parse_int("ECHO_STATS_CACHE_ENTRIES", &v)?;
            config.stats_cache_entries = clamp_int(n, 1, MAX_STATS_CACHE_ENTRIES) as usize;
        }
        if let Some(v) = get("ECHO_RESULT_CACHE_ENTRIES") {
            let n = parse_int("ECHO_RESULT_CACHE_ENTRIES", &v)?;
            config.result_cache_entries = clamp_cache_entries(n) as usize;
        }
        if let Some(v) = get("ECHO_RESULT_CACHE_TTL_SECS") {
            let secs = parse_int("ECHO_RESULT_CACHE_TTL_SECS", &v)?;
            config.result_cache_ttl = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(v) = get("ECHO_REQUEST_TIMEOUT_MS") {
            let ms = parse_int("ECHO_REQUEST_TIMEOUT_MS", &v)?;
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
        }
        if let Some(v) = get("ECHO_LOG_FORMAT") {
            config.log_format = v.parse()?;
        }
        Ok(config)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(MANIFEST_FILE_NAME))
    }

    pub fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_max_attempts.max(1),
            base_delay: self.fetch_backoff,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.manifest_path(), PathBuf::from("data/manifest.db"));
        assert!(!config.allow_stale);
    }

    #[test]
    fn test_overrides_and_flag_convention() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MASTER_CATALOG_PATH", "/etc/echo/catalog.yaml"),
            ("LOCAL_DATA_BASE", "/var/lib/echo"),
            ("ECHO_FETCH_MAX_ATTEMPTS", "99"),
            ("ECHO_ALLOW_STALE", "yes"),
            ("ECHO_REQUEST_TIMEOUT_MS", "2500"),
            ("ECHO_RESULT_CACHE_ENTRIES", "0"),
            ("ECHO_LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(config.catalog_path, PathBuf::from("/etc/echo/catalog.yaml"));
        assert_eq!(config.manifest_path(), PathBuf::from("/var/lib/echo/manifest.db"));
        assert_eq!(config.fetch_max_attempts, MAX_FETCH_ATTEMPTS as u32);
        assert!(config.allow_stale);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.result_cache_entries, 1);
        assert_eq!(config.log_format, LogFormat::Json);

        for off in ["0", "false", "No", " off "] {
            let config = EngineConfig::from_lookup(lookup(&[("ECHO_ALLOW_STALE", off)])).unwrap();
            assert!(!config.allow_stale, "{off}");
        }
    }

    #[test]
    fn test_malformed_number_names_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("ECHO_FETCH_BACKOFF_MS", "soon")])).unwrap_err();
        assert!(matches!(err, EchoError::InvalidParameter { ref name, .. } if name == "ECHO_FETCH_BACKOFF_MS"));
    }
}
