//! Live catalog with atomic snapshot replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::catalog::{load, parse_catalog, CatalogSnapshot, CatalogSource};
use crate::errors::EchoResult;
use crate::models::DatasetDescriptor;

pub struct CatalogRegistry {
    source: CatalogSource,
    current: RwLock<Arc<CatalogSnapshot>>,
    generation: AtomicU64,
}

impl CatalogRegistry {
    /// Load the initial snapshot (generation 1). Fails if the catalog is
    /// invalid; there is no previous snapshot to fall back to.
    pub fn open(source: CatalogSource) -> EchoResult<Self> {
        let snapshot = load(&source, 1)?;
        info!(
            "catalog loaded: {} datasets, digest {}",
            snapshot.datasets.len(),
            &snapshot.digest[..12]
        );
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        })
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, id: &str) -> EchoResult<Arc<DatasetDescriptor>> {
        self.snapshot().resolve(id)
    }

    /// Re-read the catalog source. On failure the current snapshot stays.
    pub fn reload(&self) -> EchoResult<Arc<CatalogSnapshot>> {
        let text = self.source.read()?;
        self.publish(&text)
    }

    /// Replace the catalog with `text`, e.g. one pushed by an operator.
    pub fn replace(&self, text: &str) -> EchoResult<Arc<CatalogSnapshot>> {
        self.publish(text)
    }

    fn publish(&self, text: &str) -> EchoResult<Arc<CatalogSnapshot>> {
        let mut current = self.current.write();
        let next_generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot = match parse_catalog(text, next_generation) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("catalog reload rejected, keeping generation {}: {e}", current.generation);
                return Err(e);
            }
        };
        if snapshot.digest == current.digest {
            return Ok(Arc::clone(&current));
        }
        self.generation.store(next_generation, Ordering::SeqCst);
        *current = Arc::clone(&snapshot);
        info!(
            "catalog generation {next_generation}: {} datasets",
            snapshot.datasets.len()
        );
        Ok(snapshot)
    }
}
