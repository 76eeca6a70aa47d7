pub mod follow;
pub mod manifest;
pub mod metadata;
pub mod singleflight;
pub mod storage;

pub use follow::UpstreamBlob;
pub use manifest::{CachedManifest, ManifestStore};
pub use metadata::{CacheObject, ManifestEntry};
pub use singleflight::SingleFlight;
pub use storage::{BlobResponse, BlobStream, CacheStats, CacheStorage, EvictionReport};
