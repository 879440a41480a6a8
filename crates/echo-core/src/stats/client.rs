//! Batched, cached client for the statistical data service.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::catalog::parse::is_valid_variable_code;
use crate::context::RequestContext;
use crate::errors::{EchoError, EchoResult};
use crate::models::{AttributeTable, ColumnSpec, VariableSpec};
use crate::retry::{RetryDecision, RetryFailure, RetryPolicy};
use crate::stats::{BatchRequest, BatchRow, ServiceError, StatisticalService};

/// Default lifetime of a cached batch response.
pub const DEFAULT_STATS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Default number of cached batch responses.
pub const DEFAULT_STATS_CACHE_ENTRIES: usize = 1024;

/// Dataset id used in errors raised by the statistics path.
const STATS_SOURCE: &str = "statistics";

struct CacheEntry {
    rows: Arc<Vec<BatchRow>>,
    expires_at: Instant,
}

pub struct StatisticalDataClient {
    service: Arc<dyn StatisticalService>,
    retry: RetryPolicy,
    ttl: Duration,
    max_entries: usize,
    cache: Mutex<IndexMap<String, CacheEntry>>,
    pool: Option<rayon::ThreadPool>,
}

fn batch_cache_key(request: &BatchRequest) -> String {
    let mut hasher = Sha256::new();
    for v in &request.variables {
        hasher.update(v.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);
    for k in &request.keys {
        hasher.update(k.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);
    hasher.update(request.vintage.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn classify(err: &ServiceError) -> RetryDecision {
    match err {
        ServiceError::RateLimited { retry_after } => RetryDecision::Retry { after: *retry_after },
        ServiceError::Transient(_) => RetryDecision::Retry { after: None },
        ServiceError::InvalidVariable(_) | ServiceError::Rejected(_) => RetryDecision::GiveUp,
    }
}

impl StatisticalDataClient {
    pub fn new(service: Arc<dyn StatisticalService>, retry: RetryPolicy) -> Self {
        Self::with_cache(service, retry, DEFAULT_STATS_CACHE_TTL, DEFAULT_STATS_CACHE_ENTRIES)
    }

    pub fn with_cache(
        service: Arc<dyn StatisticalService>,
        retry: RetryPolicy,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("echo-stats-{i}"))
            .build()
            .ok();
        Self {
            service,
            retry,
            ttl,
            max_entries: max_entries.max(1),
            cache: Mutex::new(IndexMap::new()),
            pool,
        }
    }

    pub fn cached_batches(&self) -> usize {
        self.cache.lock().len()
    }

    fn cache_get(&self, key: &str) -> Option<Arc<Vec<BatchRow>>> {
        let mut cache = self.cache.lock();
        let idx = cache.get_index_of(key)?;
        if cache[idx].expires_at <= Instant::now() {
            cache.shift_remove_index(idx);
            return None;
        }
        let last = cache.len() - 1;
        cache.move_index(idx, last);
        cache.get(key).map(|e| Arc::clone(&e.rows))
    }

    fn cache_put(&self, key: String, rows: Arc<Vec<BatchRow>>) {
        let mut cache = self.cache.lock();
        let now = Instant::now();
        cache.retain(|_, e| e.expires_at > now);
        cache.insert(
            key,
            CacheEntry {
                rows,
                expires_at: now + self.ttl,
            },
        );
        while cache.len() > self.max_entries {
            cache.shift_remove_index(0);
        }
    }

    fn fetch_one(&self, request: &BatchRequest, ctx: &RequestContext) -> EchoResult<Arc<Vec<BatchRow>>> {
        let key = batch_cache_key(request);
        if let Some(hit) = self.cache_get(&key) {
            debug!("statistics batch of {} keys served from cache", request.keys.len());
            return Ok(hit);
        }
        ctx.check("fetching statistics")?;

        let label = format!("statistics batch of {} keys", request.keys.len());
        let outcome = self.retry.run(
            &label,
            ctx.deadline(),
            |_| self.service.fetch_batch(request),
            classify,
        );
        let rows = match outcome {
            Ok(rows) => rows,
            Err(RetryFailure::Fatal(ServiceError::InvalidVariable(v))) => {
                return Err(EchoError::InvalidVariable(v));
            }
            Err(RetryFailure::Fatal(e)) => {
                return Err(EchoError::unavailable(STATS_SOURCE, e.to_string()));
            }
            Err(RetryFailure::Exhausted { last, attempts }) => {
                warn!("{label}: giving up after {attempts} attempts: {last}");
                return Err(EchoError::unavailable(
                    STATS_SOURCE,
                    format!("{last} (after {attempts} attempts)"),
                ));
            }
            Err(RetryFailure::Deadline { last, attempts }) => {
                return Err(EchoError::Timeout(format!(
                    "fetching statistics ({attempts} attempts, last error: {last})"
                )));
            }
        };

        let width = request.variables.len();
        if let Some(bad) = rows.iter().find(|r| r.values.len() != width) {
            return Err(EchoError::Format(format!(
                "statistics row `{}` has {} values, expected {width}",
                bad.key,
                bad.values.len()
            )));
        }
        let rows = Arc::new(rows);
        self.cache_put(key, Arc::clone(&rows));
        Ok(rows)
    }

    /// Fetch `variables` for `keys`.
    ///
    /// Keys are trimmed, deduplicated and sorted, then split into batches no
    /// larger than the service's per-call limit. Each batch is retried on its
    /// own and cached on success, so a request retried after a partial
    /// failure only re-fetches the batches that failed. The result holds one
    /// row per distinct key, in key order, with `None` for missing values.
    pub fn fetch(
        &self,
        variables: &[VariableSpec],
        keys: &[String],
        vintage: &str,
        ctx: &RequestContext,
    ) -> EchoResult<AttributeTable> {
        if variables.is_empty() {
            return Err(EchoError::invalid_parameter("variables", "at least one variable is required"));
        }
        let mut columns: Vec<ColumnSpec> = Vec::new();
        for v in variables {
            if !is_valid_variable_code(&v.code) {
                return Err(EchoError::InvalidVariable(v.code.clone()));
            }
            if !columns.iter().any(|c| c.name == v.code) {
                columns.push(ColumnSpec {
                    name: v.code.clone(),
                    unit: v.unit.clone(),
                });
            }
        }
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        let codes: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        let distinct: BTreeSet<String> = keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        let distinct: Vec<String> = distinct.into_iter().collect();
        let mut table = AttributeTable::new("geography_key", columns);
        if distinct.is_empty() {
            return Ok(table);
        }

        let per_call = self.service.max_keys_per_call().max(1);
        let requests: Vec<BatchRequest> = distinct
            .chunks(per_call)
            .map(|chunk| BatchRequest {
                variables: codes.clone(),
                keys: chunk.to_vec(),
                vintage: vintage.to_string(),
            })
            .collect();
        debug!(
            "statistics: {} keys x {} variables in {} batch(es)",
            distinct.len(),
            codes.len(),
            requests.len()
        );

        let outcomes: Vec<EchoResult<Arc<Vec<BatchRow>>>> = match &self.pool {
            Some(pool) => pool.install(|| {
                requests
                    .par_iter()
                    .map(|r| self.fetch_one(r, ctx))
                    .collect()
            }),
            None => requests.iter().map(|r| self.fetch_one(r, ctx)).collect(),
        };

        let mut by_key: HashMap<String, Vec<Option<f64>>> = HashMap::with_capacity(distinct.len());
        for outcome in outcomes {
            for row in outcome?.iter() {
                by_key.insert(row.key.trim().to_string(), row.values.clone());
            }
        }
        for key in distinct {
            let values = by_key
                .remove(&key)
                .unwrap_or_else(|| vec![None; codes.len()]);
            table.insert_row(key, values)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns `population = key length` for each key; fails on demand.
    struct FakeService {
        limit: usize,
        calls: AtomicUsize,
        fail_first: usize,
        failure: ServiceError,
        fail_keys_containing: Mutex<Option<String>>,
        drop_keys: Vec<String>,
    }

    impl FakeService {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                calls: AtomicUsize::new(0),
                fail_first: 0,
                failure: ServiceError::Transient("boom".into()),
                fail_keys_containing: Mutex::new(None),
                drop_keys: vec![],
            }
        }
    }

    impl StatisticalService for FakeService {
        fn max_keys_per_call(&self) -> usize {
            self.limit
        }

        fn fetch_batch(&self, request: &BatchRequest) -> Result<Vec<BatchRow>, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.keys.len() <= self.limit);
            if n < self.fail_first {
                return Err(self.failure.clone());
            }
            if let Some(marker) = self.fail_keys_containing.lock().as_deref() {
                if request.keys.iter().any(|k| k.contains(marker)) {
                    return Err(ServiceError::Rejected("poisoned batch".into()));
                }
            }
            if let Some(v) = request.variables.iter().find(|v| v.starts_with("bogus")) {
                return Err(ServiceError::InvalidVariable(v.clone()));
            }
            Ok(request
                .keys
                .iter()
                .filter(|k| !self.drop_keys.contains(k))
                .map(|k| BatchRow {
                    key: k.clone(),
                    values: request.variables.iter().map(|_| Some(k.len() as f64)).collect(),
                })
                .collect())
        }
    }

    fn vars(codes: &[&str]) -> Vec<VariableSpec> {
        codes
            .iter()
            .map(|c| VariableSpec {
                code: c.to_string(),
                unit: None,
            })
            .collect()
    }

    fn client(service: Arc<FakeService>) -> StatisticalDataClient {
        StatisticalDataClient::new(service, RetryPolicy::immediate(4))
    }

    #[test]
    fn test_keys_are_batched_under_the_service_limit() {
        let service = Arc::new(FakeService::new(500));
        let c = client(Arc::clone(&service));
        let keys: Vec<String> = (0..600).map(|i| format!("{:05}", i)).collect();
        let table = c
            .fetch(&vars(&["population"]), &keys, "2021", &RequestContext::unbounded())
            .unwrap();
        assert_eq!(table.len(), 600);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(table.keys().next(), Some("00000"));
        assert_eq!(table.value("00599", "population"), Some(5.0));
    }

    #[test]
    fn test_keys_are_trimmed_and_deduplicated() {
        let service = Arc::new(FakeService::new(10));
        let c = client(Arc::clone(&service));
        let keys: Vec<String> = vec![" b ".into(), "a".into(), "b".into(), "".into()];
        let table = c
            .fetch(&vars(&["x"]), &keys, "2021", &RequestContext::unbounded())
            .unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_keys_become_null_rows() {
        let mut fake = FakeService::new(10);
        fake.drop_keys = vec!["gone".into()];
        let c = client(Arc::new(fake));
        let keys: Vec<String> = vec!["here".into(), "gone".into()];
        let table = c
            .fetch(&vars(&["x", "y"]), &keys, "2021", &RequestContext::unbounded())
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.value("gone", "x"), None);
        assert_eq!(table.value("here", "y"), Some(4.0));
    }

    #[test]
    fn test_rate_limits_are_retried() {
        let mut fake = FakeService::new(10);
        fake.fail_first = 2;
        fake.failure = ServiceError::RateLimited {
            retry_after: Some(Duration::from_millis(5)),
        };
        let service = Arc::new(fake);
        let c = client(Arc::clone(&service));
        let started = Instant::now();
        let table = c
            .fetch(&vars(&["x"]), &["k".to_string()], "2021", &RequestContext::unbounded())
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_variable_fails_fast() {
        let service = Arc::new(FakeService::new(10));
        let c = client(Arc::clone(&service));
        let err = c
            .fetch(&vars(&["bogus_var"]), &["k".to_string()], "2021", &RequestContext::unbounded())
            .unwrap_err();
        assert!(matches!(err, EchoError::InvalidVariable(v) if v == "bogus_var"));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        let err = c
            .fetch(&vars(&["9lives"]), &["k".to_string()], "2021", &RequestContext::unbounded())
            .unwrap_err();
        assert!(matches!(err, EchoError::InvalidVariable(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_successful_batches_are_not_refetched_after_partial_failure() {
        let service = Arc::new(FakeService::new(2));
        *service.fail_keys_containing.lock() = Some("z".into());
        let c = client(Arc::clone(&service));
        let keys: Vec<String> = vec!["a".into(), "b".into(), "c".into(), "z".into()];
        let ctx = RequestContext::unbounded();

        let err = c.fetch(&vars(&["x"]), &keys, "2021", &ctx).unwrap_err();
        assert!(matches!(err, EchoError::DatasetUnavailable { .. }));
        let after_failure = service.calls.load(Ordering::SeqCst);
        assert_eq!(after_failure, 2);

        *service.fail_keys_containing.lock() = None;
        let table = c.fetch(&vars(&["x"]), &keys, "2021", &ctx).unwrap();
        assert_eq!(table.len(), 4);
        // Only the failed batch ["c", "z"] was fetched again.
        assert_eq!(service.calls.load(Ordering::SeqCst), after_failure + 1);
    }

    #[test]
    fn test_cache_is_keyed_by_vintage_and_expires() {
        let service = Arc::new(FakeService::new(10));
        let c = StatisticalDataClient::with_cache(
            Arc::clone(&service) as Arc<dyn StatisticalService>,
            RetryPolicy::immediate(1),
            Duration::from_millis(50),
            16,
        );
        let keys = vec!["k".to_string()];
        let ctx = RequestContext::unbounded();
        c.fetch(&vars(&["x"]), &keys, "2021", &ctx).unwrap();
        c.fetch(&vars(&["x"]), &keys, "2021", &ctx).unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        c.fetch(&vars(&["x"]), &keys, "2016", &ctx).unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        std::thread::sleep(Duration::from_millis(80));
        c.fetch(&vars(&["x"]), &keys, "2021", &ctx).unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_expired_deadline_stops_before_calling() {
        let service = Arc::new(FakeService::new(10));
        let c = client(Arc::clone(&service));
        let ctx = RequestContext::with_timeout(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        let err = c.fetch(&vars(&["x"]), &["k".to_string()], "2021", &ctx).unwrap_err();
        assert!(matches!(err, EchoError::Timeout(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }
}
