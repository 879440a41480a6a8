//! Local materialisation of catalog datasets.

pub mod layers;
pub mod manifest;
pub mod object_store;
pub mod schema;
pub mod sync;

pub use manifest::Manifest;
pub use object_store::{FileObjectStore, ObjectStore, ObjectStoreRouter, RemoteObject};
pub use sync::{FallbackPolicy, StorageSync};
