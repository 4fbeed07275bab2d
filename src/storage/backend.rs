//! Storage backend abstraction
//!
//! The cache engine never speaks a storage protocol itself. Anything that can
//! report object metadata and serve byte ranges can sit behind it.

use crate::error::CacheResult;
use crate::storage::types::{ObjectMetadata, Range};
use async_trait::async_trait;

/// Read capability the cache engine consumes from a storage provider
///
/// Errors should be reported as `CacheError::Backend` (transient, retryable)
/// or `CacheError::ObjectNotFound`; the cache passes them through unchanged.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch size and version information for an object
    async fn get_object_metadata(&self, path: &str) -> CacheResult<ObjectMetadata>;

    /// Fetch an object, or the bytes of `range` within it
    ///
    /// A range extending past the end of the object returns the bytes that
    /// exist; a range starting at or past the end returns an empty buffer.
    async fn get_object(&self, path: &str, range: Option<Range>) -> CacheResult<Vec<u8>>;

    /// Short name for log lines
    fn backend_name(&self) -> &'static str {
        "backend"
    }
}
