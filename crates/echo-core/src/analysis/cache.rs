//! Memoization of analysis results keyed on a request fingerprint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::EchoResult;
use crate::models::AnalysisResult;
use crate::singleflight::{Role, SingleFlight};

/// SHA-256 over everything that can change an analysis result.
///
/// Parts are separated by a NUL byte so that no two part lists hash the
/// same text.
pub fn fingerprint(
    analysis_type: &str,
    executor_version: u32,
    dataset_versions: &BTreeMap<String, String>,
    vintage: &str,
    canonical_params: &str,
    canonical_geometry: &str,
) -> String {
    let mut hasher = Sha256::new();
    let mut part = |text: &str| {
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
    };
    part(analysis_type);
    part(&executor_version.to_string());
    for (dataset, version) in dataset_versions {
        part(dataset);
        part(version);
    }
    part("--");
    part(vintage);
    part(canonical_params);
    part(canonical_geometry);
    format!("{:x}", hasher.finalize())
}

/// How a [`ResultCache::get_or_compute`] call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Computed,
    /// Waited on an identical request already computing.
    Joined,
}

struct CacheEntry {
    value: Arc<AnalysisResult>,
    inserted_at: Instant,
}

pub struct ResultCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<IndexMap<String, CacheEntry>>,
    flights: SingleFlight<String, Arc<AnalysisResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            entries: Mutex::new(IndexMap::new()),
            flights: SingleFlight::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn counters(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn lookup(&self, fingerprint: &str) -> Option<Arc<AnalysisResult>> {
        let mut entries = self.entries.lock();
        let idx = entries.get_index_of(fingerprint)?;
        if entries[idx].inserted_at.elapsed() >= self.ttl {
            entries.shift_remove_index(idx);
            return None;
        }
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        entries.get(fingerprint).map(|e| Arc::clone(&e.value))
    }

    fn store(&self, fingerprint: &str, value: &Arc<AnalysisResult>) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                value: Arc::clone(value),
                inserted_at: now,
            },
        );
        while entries.len() > self.max_entries {
            entries.shift_remove_index(0);
        }
    }

    /// Return the cached result for `fingerprint` or compute it once.
    ///
    /// Concurrent callers with the same fingerprint share one computation;
    /// they stop waiting when `ctx` expires. Failures are handed to every
    /// waiting caller but never cached.
    pub fn get_or_compute<F>(
        &self,
        fingerprint: &str,
        ctx: &RequestContext,
        compute: F,
    ) -> EchoResult<(Arc<AnalysisResult>, CacheOutcome)>
    where
        F: FnOnce() -> EchoResult<AnalysisResult>,
    {
        if let Some(hit) = self.lookup(fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("result cache hit {}", &fingerprint[..fingerprint.len().min(12)]);
            return Ok((hit, CacheOutcome::Hit));
        }

        let key = fingerprint.to_string();
        let mut computed = false;
        let (value, role) = self
            .flights
            .run(&key, ctx.deadline(), "waiting for an identical analysis", || {
                if let Some(hit) = self.lookup(fingerprint) {
                    return Ok(hit);
                }
                computed = true;
                let value = Arc::new(compute()?);
                self.store(fingerprint, &value);
                Ok(value)
            })?;

        let outcome = match (role, computed) {
            (Role::Follower, _) => CacheOutcome::Joined,
            (Role::Leader, true) => CacheOutcome::Computed,
            (Role::Leader, false) => CacheOutcome::Hit,
        };
        if outcome == CacheOutcome::Hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok((value, outcome))
    }

    /// Drop entries computed against a version of `dataset_id` other than
    /// `current_version`.
    pub fn purge_dataset(&self, dataset_id: &str, current_version: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            e.value
                .dataset_versions
                .get(dataset_id)
                .map_or(true, |v| v == current_version)
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::errors::EchoError;

    fn result(fingerprint: &str, versions: &[(&str, &str)]) -> AnalysisResult {
        AnalysisResult {
            analysis_type: "overlay_statistics".into(),
            executor_version: 1,
            fingerprint: fingerprint.into(),
            dataset_versions: versions
                .iter()
                .map(|(d, v)| (d.to_string(), v.to_string()))
                .collect(),
            stale_datasets: vec![],
            metrics: IndexMap::new(),
            features: vec![],
            diagnostics: vec![],
        }
    }

    fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(d, v)| (d.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_fingerprint_depends_on_every_part() {
        let v1 = versions(&[("census", "a"), ("parcels", "b")]);
        let base = fingerprint("overlay", 1, &v1, "2021", "{}", "EPSG:4326;POINT(0 0)");
        assert_eq!(base.len(), 64);
        assert_eq!(base, fingerprint("overlay", 1, &v1, "2021", "{}", "EPSG:4326;POINT(0 0)"));
        let variants = [
            fingerprint("nearest", 1, &v1, "2021", "{}", "EPSG:4326;POINT(0 0)"),
            fingerprint("overlay", 2, &v1, "2021", "{}", "EPSG:4326;POINT(0 0)"),
            fingerprint("overlay", 1, &versions(&[("census", "a"), ("parcels", "c")]), "2021", "{}", "EPSG:4326;POINT(0 0)"),
            fingerprint("overlay", 1, &v1, "2016", "{}", "EPSG:4326;POINT(0 0)"),
            fingerprint("overlay", 1, &v1, "2021", r#"{"k":1}"#, "EPSG:4326;POINT(0 0)"),
            fingerprint("overlay", 1, &v1, "2021", "{}", "EPSG:4326;POINT(0 1)"),
        ];
        for v in variants {
            assert_ne!(v, base);
        }
    }

    #[test]
    fn test_hit_after_compute_and_errors_not_cached() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let ctx = RequestContext::unbounded();
        let calls = AtomicUsize::new(0);

        let err = cache
            .get_or_compute("fp", &ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EchoError::Transient("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, EchoError::Transient(_)));
        assert!(cache.is_empty());

        let (_, first) = cache
            .get_or_compute("fp", &ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result("fp", &[]))
            })
            .unwrap();
        let (_, second) = cache
            .get_or_compute("fp", &ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result("fp", &[]))
            })
            .unwrap();
        assert_eq!(first, CacheOutcome::Computed);
        assert_eq!(second, CacheOutcome::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.counters(), (1, 1));
    }

    #[test]
    fn test_concurrent_identical_requests_compute_once() {
        let cache = Arc::new(ResultCache::new(8, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_compute("same", &RequestContext::unbounded(), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(result("same", &[]))
                        })
                        .unwrap()
                        .0
                })
            })
            .collect();
        let results: Vec<Arc<AnalysisResult>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_lru_capacity_and_ttl() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        let ctx = RequestContext::unbounded();
        for fp in ["a", "b"] {
            cache.get_or_compute(fp, &ctx, || Ok(result(fp, &[]))).unwrap();
        }
        // Touch "a" so "b" is the least recently used.
        cache.get_or_compute("a", &ctx, || Ok(result("a", &[]))).unwrap();
        cache.get_or_compute("c", &ctx, || Ok(result("c", &[]))).unwrap();
        assert_eq!(cache.len(), 2);
        let (_, outcome) = cache.get_or_compute("b", &ctx, || Ok(result("b", &[]))).unwrap();
        assert_eq!(outcome, CacheOutcome::Computed);

        let short = ResultCache::new(4, Duration::from_millis(20));
        short.get_or_compute("x", &ctx, || Ok(result("x", &[]))).unwrap();
        thread::sleep(Duration::from_millis(40));
        let (_, outcome) = short.get_or_compute("x", &ctx, || Ok(result("x", &[]))).unwrap();
        assert_eq!(outcome, CacheOutcome::Computed);
    }

    #[test]
    fn test_purge_dataset_keeps_current_version() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let ctx = RequestContext::unbounded();
        cache
            .get_or_compute("old", &ctx, || Ok(result("old", &[("parcels", "v1")])))
            .unwrap();
        cache
            .get_or_compute("new", &ctx, || Ok(result("new", &[("parcels", "v2")])))
            .unwrap();
        cache
            .get_or_compute("other", &ctx, || Ok(result("other", &[("stops", "v9")])))
            .unwrap();
        assert_eq!(cache.purge_dataset("parcels", "v2"), 1);
        assert_eq!(cache.len(), 2);
    }
}
