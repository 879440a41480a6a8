//! The analysis engine: request in, memoized result out.
//!
//! Flow for one request: validate parameters, resolve the executor's
//! datasets in the current catalog snapshot, make every artifact local and
//! current, fingerprint the request against the artifact versions, then
//! serve it from the result cache or run the executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::analysis::cache::{fingerprint, CacheOutcome, ResultCache};
use crate::analysis::{DatasetAccess, ExecutionInputs, ExecutorRegistry};
use crate::catalog::{CatalogRegistry, CatalogSnapshot, CatalogSource};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::errors::{EchoError, EchoResult};
use crate::models::{
    AnalysisRequest, AnalysisResult, ArtifactStatus, AttributeTable, DatasetArtifact, VariableSpec,
};
use crate::observability::analysis_span;
use crate::spatial::join::SpatialJoinEngine;
use crate::spatial::layer::PreparedLayer;
use crate::stats::{StatisticalDataClient, StatisticalService};
use crate::store::layers::{load_attribute_table, load_layer, VersionedCache};
use crate::store::{FallbackPolicy, ObjectStore, ObjectStoreRouter, StorageSync};

pub struct AnalysisEngine {
    config: EngineConfig,
    catalog: CatalogRegistry,
    sync: StorageSync,
    stats: Option<StatisticalDataClient>,
    joins: SpatialJoinEngine,
    executors: ExecutorRegistry,
    layers: VersionedCache<PreparedLayer>,
    tables: VersionedCache<AttributeTable>,
    results: ResultCache,
    /// Last artifact version seen per dataset.
    seen_versions: Mutex<HashMap<String, String>>,
}

impl AnalysisEngine {
    /// Engine over local `file://` datasets and no statistical service.
    pub fn from_config(config: EngineConfig) -> EchoResult<Self> {
        Self::new(config, Arc::new(ObjectStoreRouter::default()), None)
    }

    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        stats_service: Option<Arc<dyn StatisticalService>>,
    ) -> EchoResult<Self> {
        let catalog = CatalogRegistry::open(CatalogSource::Path(config.catalog_path.clone()))?;
        Self::with_catalog(config, catalog, store, stats_service)
    }

    pub fn with_catalog(
        config: EngineConfig,
        catalog: CatalogRegistry,
        store: Arc<dyn ObjectStore>,
        stats_service: Option<Arc<dyn StatisticalService>>,
    ) -> EchoResult<Self> {
        let sync = StorageSync::open(&config.data_dir, config.manifest_path(), store, config.fetch_retry())?;
        let stats = stats_service.map(|service| {
            StatisticalDataClient::with_cache(
                service,
                config.fetch_retry(),
                config.stats_cache_ttl,
                config.stats_cache_entries,
            )
        });
        info!(
            "analysis engine ready: catalog generation {}, {} dataset(s), data dir {}",
            catalog.generation(),
            catalog.snapshot().datasets.len(),
            config.data_dir.display()
        );
        Ok(Self {
            layers: VersionedCache::new(config.prepared_layer_capacity),
            tables: VersionedCache::new(config.prepared_layer_capacity),
            results: ResultCache::new(config.result_cache_entries, config.result_cache_ttl),
            config,
            catalog,
            sync,
            stats,
            joins: SpatialJoinEngine::default(),
            executors: ExecutorRegistry::with_defaults(),
            seen_versions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.snapshot()
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn executors_mut(&mut self) -> &mut ExecutorRegistry {
        &mut self.executors
    }

    pub fn storage(&self) -> &StorageSync {
        &self.sync
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.results
    }

    /// Re-read the catalog source; returns the generation now current.
    pub fn reload_catalog(&self) -> EchoResult<u64> {
        Ok(self.catalog.reload()?.generation)
    }

    /// Context for a request without its own deadline.
    pub fn default_context(&self) -> RequestContext {
        match self.config.request_timeout {
            Some(timeout) => RequestContext::with_timeout(timeout),
            None => RequestContext::unbounded(),
        }
    }

    fn fallback(&self) -> FallbackPolicy {
        if self.config.allow_stale {
            FallbackPolicy::AllowStale
        } else {
            FallbackPolicy::Strict
        }
    }

    pub fn analyze(&self, request: &AnalysisRequest, ctx: &RequestContext) -> EchoResult<Arc<AnalysisResult>> {
        self.analyze_with_fallback(request, ctx, self.fallback())
    }

    pub fn analyze_with_fallback(
        &self,
        request: &AnalysisRequest,
        ctx: &RequestContext,
        fallback: FallbackPolicy,
    ) -> EchoResult<Arc<AnalysisResult>> {
        let snapshot = self.catalog.snapshot();
        let span = analysis_span(&request.analysis_type, snapshot.generation);
        let _guard = span.enter();

        let executor = self.executors.get(&request.analysis_type)?;
        request.geometry.require_crs()?;
        let params = executor.schema().validate(&request.params)?;
        let requirements = executor.requirements(&params, &snapshot)?;
        if !requirements.service_variables.is_empty() && self.stats.is_none() {
            return Err(EchoError::unavailable("statistics", "no statistical service is configured"));
        }

        let mut artifacts: HashMap<String, DatasetArtifact> = HashMap::new();
        let mut dataset_versions = BTreeMap::new();
        let mut stale_datasets = Vec::new();
        for id in &requirements.datasets {
            let descriptor = snapshot.resolve(id)?;
            let artifact = self.sync.ensure_local(&descriptor, fallback, ctx)?;
            if artifact.status == ArtifactStatus::Stale {
                stale_datasets.push(id.clone());
            }
            let revision = artifact.revision();
            self.note_version(id, &revision);
            dataset_versions.insert(id.clone(), revision);
            artifacts.insert(id.clone(), artifact);
        }

        let fp = fingerprint(
            executor.name(),
            executor.version(),
            &dataset_versions,
            &snapshot.statistics.vintage,
            &params.canonical_json(),
            &request.geometry.canonical_text(),
        );

        let compute = || -> EchoResult<AnalysisResult> {
            let data = RequestData {
                engine: self,
                snapshot: &snapshot,
                artifacts: &artifacts,
                ctx,
            };
            let payload = executor.execute(&ExecutionInputs {
                geometry: &request.geometry,
                params: &params,
                catalog: &snapshot,
                data: &data,
                joins: &self.joins,
                ctx,
            })?;
            let mut diagnostics = payload.diagnostics;
            for id in &stale_datasets {
                diagnostics.push(format!("{id}: served from a stale copy after a failed refresh"));
            }
            Ok(AnalysisResult {
                analysis_type: executor.name().to_string(),
                executor_version: executor.version(),
                fingerprint: fp.clone(),
                dataset_versions: dataset_versions.clone(),
                stale_datasets: stale_datasets.clone(),
                metrics: payload
                    .metrics
                    .into_iter()
                    .map(|(k, v)| (k, v.filter(|x| x.is_finite())))
                    .collect(),
                features: payload.features,
                diagnostics,
            })
        };

        // Results built on a stale fallback are returned but never memoized.
        if !stale_datasets.is_empty() {
            warn!(
                "{}: computing without cache, stale dataset(s): {}",
                executor.name(),
                stale_datasets.join(", ")
            );
            return Ok(Arc::new(compute()?));
        }

        let (result, outcome) = self.results.get_or_compute(&fp, ctx, compute)?;
        match outcome {
            CacheOutcome::Hit => debug!("{}: served from result cache", executor.name()),
            CacheOutcome::Joined => debug!("{}: joined an identical request", executor.name()),
            CacheOutcome::Computed => info!(
                "{}: computed ({} metric(s), {} feature(s))",
                executor.name(),
                result.metrics.len(),
                result.features.len()
            ),
        }
        Ok(result)
    }

    /// Record the version served for `dataset_id`; on a change, drop what
    /// was prepared or memoized for older versions.
    fn note_version(&self, dataset_id: &str, version: &str) {
        let previous = self
            .seen_versions
            .lock()
            .insert(dataset_id.to_string(), version.to_string());
        if let Some(previous) = previous.filter(|p| p != version) {
            let layers = self.layers.purge_dataset(dataset_id);
            let tables = self.tables.purge_dataset(dataset_id);
            let results = self.results.purge_dataset(dataset_id, version);
            info!(
                "{dataset_id}: version {previous} -> {version}; purged {} prepared, {results} cached result(s)",
                layers + tables
            );
        }
    }
}

/// Dataset access for one request, bound to the artifacts it synced.
struct RequestData<'a> {
    engine: &'a AnalysisEngine,
    snapshot: &'a CatalogSnapshot,
    artifacts: &'a HashMap<String, DatasetArtifact>,
    ctx: &'a RequestContext,
}

impl RequestData<'_> {
    fn artifact(&self, dataset_id: &str) -> EchoResult<&DatasetArtifact> {
        self.artifacts
            .get(dataset_id)
            .ok_or_else(|| EchoError::unavailable(dataset_id, "not synced for this request"))
    }
}

impl DatasetAccess for RequestData<'_> {
    fn layer(&self, dataset_id: &str) -> EchoResult<Arc<PreparedLayer>> {
        let artifact = self.artifact(dataset_id)?;
        let descriptor = self.snapshot.resolve(dataset_id)?;
        self.engine
            .layers
            .get_or_build(dataset_id, &artifact.revision(), || load_layer(&descriptor, artifact))
    }

    fn table(&self, dataset_id: &str) -> EchoResult<Arc<AttributeTable>> {
        let artifact = self.artifact(dataset_id)?;
        let descriptor = self.snapshot.resolve(dataset_id)?;
        self.engine
            .tables
            .get_or_build(dataset_id, &artifact.revision(), || load_attribute_table(&descriptor, artifact))
    }

    fn statistics(&self, variables: &[VariableSpec], keys: &[String]) -> EchoResult<AttributeTable> {
        let client = self
            .engine
            .stats
            .as_ref()
            .ok_or_else(|| EchoError::unavailable("statistics", "no statistical service is configured"))?;
        client.fetch(variables, keys, &self.snapshot.statistics.vintage, self.ctx)
    }
}
