//! Storage sync: make a dataset's artifact local and current.
//!
//! Downloads land in a temp file inside the data directory and are promoted
//! with an atomic rename only after size and checksum checks pass, so readers
//! never observe a partial file. Every revision is promoted under its own
//! content-derived name. Fetches are single-flight per dataset id and
//! run on a worker thread that outlives any one request's deadline.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::RequestContext;
use crate::errors::{EchoError, EchoResult};
use crate::models::{ArtifactStatus, DatasetArtifact, DatasetDescriptor, RefreshPolicy};
use crate::retry::{RetryDecision, RetryFailure, RetryPolicy};
use crate::singleflight::{Role, SingleFlight};
use crate::store::manifest::Manifest;
use crate::store::object_store::ObjectStore;

/// File-name prefix of in-progress downloads.
pub const PARTIAL_PREFIX: &str = ".echo-partial-";

/// What a caller accepts when a refresh cannot complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Fail with `DatasetUnavailable`.
    #[default]
    Strict,
    /// Serve the previous valid copy, marked stale.
    AllowStale,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Counts and hashes bytes on their way to the temp file.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(u64, String)> {
        self.inner.flush()?;
        Ok((self.written, format!("{:x}", self.hasher.finalize())))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Lower-cased extension of the source's last path segment, `bin` when it
/// has none.
fn source_extension(descriptor: &DatasetDescriptor) -> String {
    let last = descriptor
        .source
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let last = last.split(['?', '#']).next().unwrap_or_default();
    match Path::new(last).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "bin".to_string(),
    }
}

/// Hex digits of the content hash kept in a local file name.
const NAME_HASH_LEN: usize = 12;

/// Local file name for one fetched revision: `<id>-<sha256 prefix>.<ext>`.
fn local_file_name(descriptor: &DatasetDescriptor, sha256: &str) -> String {
    let short = sha256.get(..NAME_HASH_LEN).unwrap_or(sha256);
    format!("{}-{short}.{}", descriptor.id, source_extension(descriptor))
}

/// Whether `name` is a revision file of `id`, or the unversioned name
/// earlier releases used.
fn is_revision_file(name: &str, id: &str) -> bool {
    let Some(rest) = name.strip_prefix(id) else {
        return false;
    };
    if rest.starts_with('.') && !rest[1..].contains(['.', '-']) {
        return true;
    }
    let Some(rest) = rest.strip_prefix('-') else {
        return false;
    };
    match rest.split_once('.') {
        Some((hash, ext)) => {
            hash.len() == NAME_HASH_LEN
                && hash.bytes().all(|b| b.is_ascii_hexdigit())
                && !ext.is_empty()
                && !ext.contains(['.', '-'])
        }
        None => false,
    }
}

struct SyncInner {
    data_dir: PathBuf,
    manifest: Manifest,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl SyncInner {
    /// The manifest row for `id` if its file is still there at the recorded
    /// size. A size mismatch means the copy was tampered with or truncated,
    /// and it is treated as absent.
    fn present_copy(&self, id: &str) -> EchoResult<Option<DatasetArtifact>> {
        let Some(artifact) = self.manifest.get(id)? else {
            return Ok(None);
        };
        match std::fs::metadata(&artifact.local_path) {
            Ok(meta) if meta.len() == artifact.size_bytes => Ok(Some(artifact)),
            Ok(meta) => {
                debug!(
                    "{id}: local size {} differs from manifest size {}; refetching",
                    meta.len(),
                    artifact.size_bytes
                );
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// A present copy fetched for the descriptor as it reads now. A copy
    /// from another source or under another checksum pin is absent.
    fn local_copy(&self, descriptor: &DatasetDescriptor) -> EchoResult<Option<DatasetArtifact>> {
        let Some(artifact) = self.present_copy(&descriptor.id)? else {
            return Ok(None);
        };
        if !artifact.matches(descriptor) {
            debug!(
                "{}: local copy was fetched from `{}`, catalog now names `{}`; refetching",
                descriptor.id, artifact.source, descriptor.source
            );
            return Ok(None);
        }
        Ok(Some(artifact))
    }

    /// A present local copy that needs no remote round-trip to be current.
    fn current_without_remote(&self, descriptor: &DatasetDescriptor) -> EchoResult<Option<DatasetArtifact>> {
        let Some(mut local) = self.local_copy(descriptor)? else {
            return Ok(None);
        };
        let current = match descriptor.refresh {
            RefreshPolicy::Manual => true,
            RefreshPolicy::TimeBased { interval } => {
                let age_ms = now_ms().saturating_sub(local.fetched_at_ms).max(0) as u64;
                Duration::from_millis(age_ms) < interval
            }
            RefreshPolicy::ContentHash => false,
        };
        if !current {
            return Ok(None);
        }
        local.status = ArtifactStatus::Current;
        Ok(Some(local))
    }

    /// Delete revision files of `id` that are not in `keep`.
    fn prune_revisions(&self, id: &str, keep: &[&Path]) {
        let Ok(entries) = std::fs::read_dir(&self.data_dir) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let superseded = entry
                .file_name()
                .to_str()
                .is_some_and(|n| is_revision_file(n, id))
                && !keep.iter().any(|k| *k == path.as_path());
            if !superseded {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("{id}: removed superseded copy {}", path.display()),
                Err(e) => warn!("{id}: could not remove superseded copy {}: {e}", path.display()),
            }
        }
    }

    /// Bring `descriptor` up to date. Runs on the single-flight worker.
    fn refresh(&self, descriptor: &DatasetDescriptor) -> EchoResult<DatasetArtifact> {
        if let Some(local) = self.current_without_remote(descriptor)? {
            return Ok(local);
        }
        let local = self.local_copy(descriptor)?;
        let label = format!("fetch {}", descriptor.id);
        let outcome = self.retry.run(
            &label,
            None,
            |attempt| self.attempt(descriptor, local.as_ref(), attempt),
            |e: &EchoError| {
                if e.is_retryable() {
                    RetryDecision::Retry { after: None }
                } else {
                    RetryDecision::GiveUp
                }
            },
        );
        let (attempts, last, fatal) = match outcome {
            Ok(artifact) => return Ok(artifact),
            Err(RetryFailure::Fatal(e)) => (1, e, true),
            Err(RetryFailure::Exhausted { last, attempts } | RetryFailure::Deadline { last, attempts }) => {
                (attempts, last, false)
            }
        };
        let reason = format!("fetch failed after {attempts} attempt(s): {last}");
        warn!("{}: {reason}", descriptor.id);
        let _ = self.manifest.record_event(
            &descriptor.id,
            "error",
            "fetch_failed",
            Some(&json!({ "attempts": attempts, "error": last.to_string() })),
        );
        // Errors the policy refused to retry are returned as raised.
        if fatal {
            return Err(last);
        }
        Err(EchoError::unavailable(&descriptor.id, reason))
    }

    fn attempt(
        &self,
        descriptor: &DatasetDescriptor,
        local: Option<&DatasetArtifact>,
        attempt: u32,
    ) -> EchoResult<DatasetArtifact> {
        let remote = self.store.head(&descriptor.source)?;
        if let Some(local) = local {
            if descriptor.refresh == RefreshPolicy::ContentHash && local.version == remote.version {
                debug!("{}: remote version {} unchanged", descriptor.id, remote.version);
                let mut current = local.clone();
                current.status = ArtifactStatus::Current;
                if local.status != ArtifactStatus::Current {
                    self.manifest.upsert(&current)?;
                }
                return Ok(current);
            }
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let mut temp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&self.data_dir)?;
        let mut writer = HashingWriter::new(&mut temp);
        self.store.download(&descriptor.source, &mut writer)?;
        let (size, sha256) = writer.finish()?;
        temp.as_file().sync_all()?;

        // A short or corrupted transfer is worth another attempt.
        for expected in [remote.size_bytes, descriptor.integrity.size_bytes]
            .into_iter()
            .flatten()
        {
            if expected != size {
                return Err(EchoError::Transient(format!(
                    "size mismatch for {}: expected {expected} bytes, got {size}",
                    descriptor.id
                )));
            }
        }
        if let Some(expected) = descriptor.integrity.sha256.as_deref() {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(EchoError::Transient(format!(
                    "checksum mismatch for {}: expected {expected}, got {sha256}",
                    descriptor.id
                )));
            }
        }

        let final_path = self.data_dir.join(local_file_name(descriptor, &sha256));
        temp.persist(&final_path).map_err(|e| EchoError::from(e.error))?;
        let previous = self.manifest.get(&descriptor.id)?.map(|a| a.local_path);

        let artifact = DatasetArtifact {
            dataset_id: descriptor.id.clone(),
            local_path: final_path,
            version: remote.version,
            size_bytes: size,
            sha256,
            fetched_at_ms: now_ms(),
            status: ArtifactStatus::Current,
            source: descriptor.source.clone(),
            expected_sha256: descriptor.integrity.sha256.clone(),
        };
        self.manifest.upsert(&artifact)?;
        // The previous revision stays for readers that resolved it before the swap.
        let mut keep = vec![artifact.local_path.as_path()];
        keep.extend(previous.as_deref());
        self.prune_revisions(&descriptor.id, &keep);
        let _ = self.manifest.record_event(
            &descriptor.id,
            "info",
            "fetched",
            Some(&json!({ "version": artifact.version, "size_bytes": size, "attempt": attempt })),
        );
        info!(
            "{}: fetched version {} ({size} bytes, attempt {attempt})",
            descriptor.id, artifact.version
        );
        Ok(artifact)
    }

    /// The previous copy, if it still verifies, marked stale.
    fn stale_copy(&self, descriptor: &DatasetDescriptor) -> EchoResult<Option<DatasetArtifact>> {
        let Some(mut local) = self.local_copy(descriptor)? else {
            return Ok(None);
        };
        local.status = ArtifactStatus::Stale;
        self.manifest.upsert(&local)?;
        Ok(Some(local))
    }
}

pub struct StorageSync {
    inner: Arc<SyncInner>,
    flights: SingleFlight<String, DatasetArtifact>,
}

impl StorageSync {
    /// Open the manifest, create the data directory and sweep leftovers of
    /// interrupted downloads.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
    ) -> EchoResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let manifest = Manifest::open(manifest_path)?;
        let sync = Self {
            inner: Arc::new(SyncInner {
                data_dir,
                manifest,
                store,
                retry,
            }),
            flights: SingleFlight::new(),
        };
        let swept = sync.sweep_partials()?;
        if swept > 0 {
            info!("removed {swept} partial download(s) from an earlier run");
        }
        Ok(sync)
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// Delete orphaned temp files left in the data directory.
    pub fn sweep_partials(&self) -> EchoResult<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.inner.data_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            let is_partial = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
            if is_partial {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Make `descriptor`'s artifact local and current, or fail.
    ///
    /// With [`FallbackPolicy::AllowStale`], a failed refresh returns the
    /// previous valid copy with `status = Stale`; the fallback is logged and
    /// recorded as a sync event.
    pub fn ensure_local(
        &self,
        descriptor: &Arc<DatasetDescriptor>,
        fallback: FallbackPolicy,
        ctx: &RequestContext,
    ) -> EchoResult<DatasetArtifact> {
        let id = descriptor.id.clone();
        ctx.check(&format!("syncing {id}"))?;
        if let Some(local) = self.inner.current_without_remote(descriptor)? {
            return Ok(local);
        }

        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(descriptor);
        let outcome = self.flights.run_detached(
            &id,
            ctx.deadline(),
            &format!("fetch of {id}"),
            move || inner.refresh(&shared),
        );
        match outcome {
            Ok((artifact, role)) => {
                if role == Role::Follower {
                    debug!("{id}: joined an in-flight fetch");
                }
                Ok(artifact)
            }
            Err(err @ EchoError::DatasetUnavailable { .. })
                if fallback == FallbackPolicy::AllowStale =>
            {
                match self.inner.stale_copy(descriptor)? {
                    Some(stale) => {
                        warn!(
                            "{id}: serving stale version {} after failed refresh: {err}",
                            stale.version
                        );
                        let _ = self.inner.manifest.record_event(
                            &id,
                            "warn",
                            "stale_fallback",
                            Some(&json!({ "version": stale.version, "error": err.to_string() })),
                        );
                        Ok(stale)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// The manifest's view of a dataset, without any remote check.
    pub fn artifact(&self, dataset_id: &str) -> EchoResult<Option<DatasetArtifact>> {
        self.inner.present_copy(dataset_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::models::{DatasetKind, Integrity, CrsDeclaration};
    use crate::spatial::crs::Crs;
    use crate::spatial::geometry::GeometryFamily;
    use crate::store::object_store::RemoteObject;

    /// In-memory store whose first `failures` downloads fail transiently.
    struct FlakyStore {
        body: parking_lot::Mutex<Vec<u8>>,
        version: parking_lot::Mutex<String>,
        failures: usize,
        downloads: AtomicUsize,
        delay: Duration,
    }

    impl FlakyStore {
        fn new(body: &[u8], failures: usize) -> Self {
            Self {
                body: parking_lot::Mutex::new(body.to_vec()),
                version: parking_lot::Mutex::new("v1".to_string()),
                failures,
                downloads: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    impl ObjectStore for FlakyStore {
        fn head(&self, _uri: &str) -> EchoResult<RemoteObject> {
            Ok(RemoteObject {
                version: self.version.lock().clone(),
                size_bytes: Some(self.body.lock().len() as u64),
            })
        }

        fn download(&self, _uri: &str, sink: &mut dyn Write) -> EchoResult<u64> {
            let n = self.downloads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if n < self.failures {
                sink.write_all(b"partial")?;
                return Err(EchoError::Transient("connection reset".to_string()));
            }
            let body = self.body.lock().clone();
            sink.write_all(&body)?;
            Ok(body.len() as u64)
        }
    }

    fn descriptor(refresh: RefreshPolicy) -> Arc<DatasetDescriptor> {
        Arc::new(DatasetDescriptor {
            id: "zones".to_string(),
            source: "s3://bucket/master/zones.json".to_string(),
            kind: DatasetKind::Layer {
                geometry: GeometryFamily::Polygon,
                crs: CrsDeclaration::Declared(Crs::WGS84),
            },
            refresh,
            join_keys: vec![],
            layer: None,
            integrity: Integrity::default(),
            description: None,
        })
    }

    fn open(dir: &Path, store: Arc<FlakyStore>, attempts: u32) -> StorageSync {
        StorageSync::open(
            dir.join("data"),
            dir.join("manifest.db"),
            store,
            RetryPolicy::immediate(attempts),
        )
        .unwrap()
    }

    #[test]
    fn test_transient_failures_are_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"{\"features\":[]}", 3));
        let sync = open(dir.path(), Arc::clone(&store), 5);

        let artifact = sync
            .ensure_local(&descriptor(RefreshPolicy::Manual), FallbackPolicy::Strict, &RequestContext::unbounded())
            .unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 4);
        assert_eq!(artifact.status, ArtifactStatus::Current);
        assert_eq!(std::fs::read(&artifact.local_path).unwrap(), b"{\"features\":[]}");
        let name = artifact.local_path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("zones-{}.json", &artifact.sha256[..12]));
        // Failed attempts leave no partial files behind.
        assert_eq!(sync.sweep_partials().unwrap(), 0);
    }

    #[test]
    fn test_exhausted_retries_make_dataset_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 10));
        let sync = open(dir.path(), Arc::clone(&store), 3);
        let err = sync
            .ensure_local(&descriptor(RefreshPolicy::Manual), FallbackPolicy::AllowStale, &RequestContext::unbounded())
            .unwrap_err();
        assert!(matches!(err, EchoError::DatasetUnavailable { .. }));
        assert_eq!(store.downloads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_manual_policy_never_refetches_present_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::Manual);
        let ctx = RequestContext::unbounded();
        sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        *store.version.lock() = "v2".to_string();
        let again = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(again.version, "v1");
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_content_hash_policy_follows_remote_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::ContentHash);
        let ctx = RequestContext::unbounded();

        sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);

        *store.version.lock() = "v2".to_string();
        *store.body.lock() = b"abcd".to_vec();
        let updated = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(updated.version, "v2");
        assert_eq!(updated.size_bytes, 4);
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_size_mismatch_on_disk_forces_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::Manual);
        let ctx = RequestContext::unbounded();
        let first = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        std::fs::write(&first.local_path, b"truncated!").unwrap();
        sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(&first.local_path).unwrap(), b"abc");
    }

    #[test]
    fn test_stale_fallback_is_explicit_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 2);
        let desc = descriptor(RefreshPolicy::ContentHash);
        let ctx = RequestContext::unbounded();
        sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();

        // New remote version whose downloads always fail.
        let broken = Arc::new(FlakyStore::new(b"abcd", usize::MAX));
        *broken.version.lock() = "v2".to_string();
        let sync = open(dir.path(), broken, 2);

        let strict = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx);
        assert!(matches!(strict, Err(EchoError::DatasetUnavailable { .. })));

        let stale = sync.ensure_local(&desc, FallbackPolicy::AllowStale, &ctx).unwrap();
        assert_eq!(stale.status, ArtifactStatus::Stale);
        assert_eq!(stale.version, "v1");
        let events = sync.manifest().recent_events(Some("zones"), 1).unwrap();
        assert_eq!(events[0].event_type, "stale_fallback");
        assert_eq!(events[0].level, "warn");
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 2);
        let mut desc = (*descriptor(RefreshPolicy::Manual)).clone();
        desc.integrity.sha256 = Some("0".repeat(64));
        let err = sync
            .ensure_local(&Arc::new(desc), FallbackPolicy::Strict, &RequestContext::unbounded())
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(sync.artifact("zones").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_requests_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut flaky = FlakyStore::new(b"abc", 0);
        flaky.delay = Duration::from_millis(150);
        let store = Arc::new(flaky);
        let sync = Arc::new(open(dir.path(), Arc::clone(&store), 1));
        let desc = descriptor(RefreshPolicy::Manual);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let desc = Arc::clone(&desc);
                std::thread::spawn(move || {
                    sync.ensure_local(&desc, FallbackPolicy::Strict, &RequestContext::unbounded())
                        .unwrap()
                })
            })
            .collect();
        let versions: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().version).collect();
        assert!(versions.iter().all(|v| v == "v1"));
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deadline_stops_waiting_but_not_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut flaky = FlakyStore::new(b"abc", 0);
        flaky.delay = Duration::from_millis(200);
        let store = Arc::new(flaky);
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::Manual);

        let hurried = RequestContext::with_timeout(Duration::from_millis(20));
        let err = sync.ensure_local(&desc, FallbackPolicy::Strict, &hurried).unwrap_err();
        assert!(matches!(err, EchoError::Timeout(_)));

        let patient = sync
            .ensure_local(&desc, FallbackPolicy::Strict, &RequestContext::unbounded())
            .unwrap();
        assert_eq!(patient.version, "v1");
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_sweeps_partial_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join(format!("{PARTIAL_PREFIX}abc123")), b"half").unwrap();
        std::fs::write(data.join("keep.json"), b"{}").unwrap();
        let sync = open(dir.path(), Arc::new(FlakyStore::new(b"", 0)), 1);
        assert!(!data.join(format!("{PARTIAL_PREFIX}abc123")).exists());
        assert!(data.join("keep.json").exists());
        assert_eq!(sync.sweep_partials().unwrap(), 0);
    }

    #[test]
    fn test_local_file_name_keeps_extension() {
        let sha = "0123456789abcdef".repeat(4);
        let mut desc = (*descriptor(RefreshPolicy::Manual)).clone();
        desc.source = "https://host/raw-master/master.GPKG?sig=abc".to_string();
        assert_eq!(local_file_name(&desc, &sha), "zones-0123456789ab.gpkg");
        desc.source = "s3://bucket/noext".to_string();
        assert_eq!(local_file_name(&desc, &sha), "zones-0123456789ab.bin");
    }

    #[test]
    fn test_revision_file_names() {
        assert!(is_revision_file("zones-0123456789ab.json", "zones"));
        assert!(is_revision_file("zones.json", "zones"));
        assert!(!is_revision_file("zones-2021-0123456789ab.json", "zones"));
        assert!(!is_revision_file("zones-2021.json", "zones"));
        assert!(!is_revision_file("zonesx-0123456789ab.json", "zones"));
        assert!(!is_revision_file(&format!("{PARTIAL_PREFIX}zones"), "zones"));
    }

    #[test]
    fn test_sequential_content_hash_refreshes_keep_old_paths_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"first", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::ContentHash);
        let ctx = RequestContext::unbounded();

        let mut artifacts = Vec::new();
        for (i, body) in [&b"first"[..], &b"second"[..], &b"third!"[..]].iter().enumerate() {
            *store.version.lock() = format!("v{}", i + 1);
            *store.body.lock() = body.to_vec();
            let artifact = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
            assert_eq!(artifact.version, format!("v{}", i + 1));
            assert_eq!(std::fs::read(&artifact.local_path).unwrap(), *body);
            artifacts.push(artifact);
        }
        assert_eq!(store.downloads.load(Ordering::SeqCst), 3);
        assert_ne!(artifacts[0].local_path, artifacts[1].local_path);
        assert_ne!(artifacts[1].local_path, artifacts[2].local_path);

        // The previous revision survives one more swap, older ones are pruned.
        assert_eq!(std::fs::read(&artifacts[1].local_path).unwrap(), b"second");
        assert!(!artifacts[0].local_path.exists());
        assert_eq!(sync.artifact("zones").unwrap().unwrap(), artifacts[2]);
    }

    #[test]
    fn test_open_handle_reads_its_revision_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"old bytes", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let desc = descriptor(RefreshPolicy::ContentHash);
        let ctx = RequestContext::unbounded();

        let old = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();
        let mut reader = std::fs::File::open(&old.local_path).unwrap();

        *store.version.lock() = "v2".to_string();
        *store.body.lock() = b"new bytes!".to_vec();
        let new = sync.ensure_local(&desc, FallbackPolicy::Strict, &ctx).unwrap();

        let mut seen = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut seen).unwrap();
        assert_eq!(seen, b"old bytes");
        assert_eq!(std::fs::read(&new.local_path).unwrap(), b"new bytes!");
    }

    #[test]
    fn test_catalog_source_change_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let ctx = RequestContext::unbounded();
        let first = sync
            .ensure_local(&descriptor(RefreshPolicy::Manual), FallbackPolicy::Strict, &ctx)
            .unwrap();
        assert_eq!(first.source, "s3://bucket/master/zones.json");

        // Same id and remote version string, new source: the old copy no
        // longer counts even under the manual policy.
        let mut moved = (*descriptor(RefreshPolicy::Manual)).clone();
        moved.source = "s3://bucket/2024/zones.json".to_string();
        *store.body.lock() = b"abcdef".to_vec();
        let second = sync.ensure_local(&Arc::new(moved), FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(second.source, "s3://bucket/2024/zones.json");
        assert_eq!(second.size_bytes, 6);
        assert_ne!(first.revision(), second.revision());
    }

    #[test]
    fn test_checksum_pin_change_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(b"abc", 0));
        let sync = open(dir.path(), Arc::clone(&store), 1);
        let ctx = RequestContext::unbounded();
        let first = sync
            .ensure_local(&descriptor(RefreshPolicy::Manual), FallbackPolicy::Strict, &ctx)
            .unwrap();
        assert_eq!(first.expected_sha256, None);

        let mut pinned = (*descriptor(RefreshPolicy::Manual)).clone();
        pinned.integrity.sha256 = Some(first.sha256.to_ascii_uppercase());
        let second = sync.ensure_local(&Arc::new(pinned.clone()), FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(second.expected_sha256, pinned.integrity.sha256);

        // Once recorded, the same pin is served locally.
        sync.ensure_local(&Arc::new(pinned), FallbackPolicy::Strict, &ctx).unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_retryable_errors_are_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sync = StorageSync::open(
            dir.path().join("data"),
            dir.path().join("manifest.db"),
            Arc::new(crate::store::ObjectStoreRouter::default()),
            RetryPolicy::immediate(5),
        )
        .unwrap();
        let err = sync
            .ensure_local(
                &descriptor(RefreshPolicy::Manual),
                FallbackPolicy::AllowStale,
                &RequestContext::unbounded(),
            )
            .unwrap_err();
        match err {
            EchoError::Format(message) => assert!(message.contains("no object store registered")),
            other => panic!("unexpected {other:?}"),
        }
        let events = sync.manifest().recent_events(Some("zones"), 1).unwrap();
        assert_eq!(events[0].event_type, "fetch_failed");
        assert_eq!(events[0].detail.as_ref().unwrap()["attempts"], 1);
    }
}
