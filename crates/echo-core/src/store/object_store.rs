//! Remote object access used by storage sync.
//!
//! Only `file://` is implemented here; other schemes are plugged in by the
//! embedding application through [`ObjectStoreRouter::register`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;

use crate::errors::{EchoError, EchoResult};

/// Metadata returned by a `head` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Opaque version tag (etag, generation number, mtime...).
    pub version: String,
    pub size_bytes: Option<u64>,
}

pub trait ObjectStore: Send + Sync {
    fn head(&self, uri: &str) -> EchoResult<RemoteObject>;

    /// Stream the object into `sink`, returning the byte count written.
    fn download(&self, uri: &str, sink: &mut dyn Write) -> EchoResult<u64>;
}

pub fn uri_scheme(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

/// Objects on a locally mounted filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileObjectStore;

impl FileObjectStore {
    fn path_of(uri: &str) -> EchoResult<PathBuf> {
        uri.strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| EchoError::Format(format!("not a file:// URI: {uri}")))
    }

    /// A missing object will not appear on retry; it is reported as
    /// unavailable straight away.
    fn map_open_error(uri: &str, err: io::Error) -> EchoError {
        if err.kind() == io::ErrorKind::NotFound {
            EchoError::unavailable(uri, "object not found")
        } else {
            EchoError::from(err)
        }
    }
}

impl ObjectStore for FileObjectStore {
    fn head(&self, uri: &str) -> EchoResult<RemoteObject> {
        let path = Self::path_of(uri)?;
        let meta = std::fs::metadata(&path).map_err(|e| Self::map_open_error(uri, e))?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(RemoteObject {
            version: format!("{modified:x}-{:x}", meta.len()),
            size_bytes: Some(meta.len()),
        })
    }

    fn download(&self, uri: &str, sink: &mut dyn Write) -> EchoResult<u64> {
        let path = Self::path_of(uri)?;
        let mut file = File::open(&path).map_err(|e| Self::map_open_error(uri, e))?;
        Ok(io::copy(&mut file, sink)?)
    }
}

/// Dispatches to a store by URI scheme.
#[derive(Clone)]
pub struct ObjectStoreRouter {
    stores: Arc<RwLock<HashMap<String, Arc<dyn ObjectStore>>>>,
}

impl Default for ObjectStoreRouter {
    fn default() -> Self {
        let router = Self {
            stores: Arc::new(RwLock::new(HashMap::new())),
        };
        router.register("file", Arc::new(FileObjectStore));
        router
    }
}

impl ObjectStoreRouter {
    pub fn register(&self, scheme: &str, store: Arc<dyn ObjectStore>) {
        self.stores.write().insert(scheme.to_ascii_lowercase(), store);
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.stores.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    fn store_for(&self, uri: &str) -> EchoResult<Arc<dyn ObjectStore>> {
        let scheme = uri_scheme(uri)
            .ok_or_else(|| EchoError::Format(format!("URI has no scheme: {uri}")))?
            .to_ascii_lowercase();
        self.stores
            .read()
            .get(&scheme)
            .cloned()
            .ok_or_else(|| EchoError::Format(format!("no object store registered for `{scheme}`")))
    }
}

impl ObjectStore for ObjectStoreRouter {
    fn head(&self, uri: &str) -> EchoResult<RemoteObject> {
        self.store_for(uri)?.head(uri)
    }

    fn download(&self, uri: &str, sink: &mut dyn Write) -> EchoResult<u64> {
        self.store_for(uri)?.download(uri, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_head_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        std::fs::write(&path, b"{\"features\": []}").unwrap();
        let uri = format!("file://{}", path.display());

        let store = ObjectStoreRouter::default();
        let head = store.head(&uri).unwrap();
        assert_eq!(head.size_bytes, Some(16));

        let mut buf = Vec::new();
        assert_eq!(store.download(&uri, &mut buf).unwrap(), 16);
        assert_eq!(buf, b"{\"features\": []}");
    }

    #[test]
    fn test_missing_object_and_unknown_scheme() {
        let store = ObjectStoreRouter::default();
        assert!(matches!(
            store.head("file:///definitely/not/here.json"),
            Err(EchoError::DatasetUnavailable { .. })
        ));
        let err = store.head("s3://bucket/key").unwrap_err();
        assert!(err.to_string().contains("no object store registered for `s3`"));
        assert_eq!(store.schemes(), vec!["file".to_string()]);
    }
}
