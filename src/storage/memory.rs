//! In-process storage backend
//!
//! Holds objects in memory and counts every call made against it, which makes
//! it the reference backend for exercising cache behaviour in tests.

use crate::error::{CacheError, CacheResult};
use crate::storage::backend::StorageBackend;
use crate::storage::types::{ObjectMetadata, Range};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// Object store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, StoredObject>>,
    metadata_calls: AtomicUsize,
    get_calls: AtomicUsize,
    failures_pending: AtomicUsize,
    latency: Option<Duration>,
}

/// Etag derived from content: first 12 hex chars of the SHA256 digest
fn content_etag(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(&result[..6])
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `get_object` call, so concurrent readers overlap
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Store (or replace) an object, returning its new etag
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) -> String {
        let data = data.into();
        let etag = content_etag(&data);
        let object = StoredObject {
            data,
            etag: etag.clone(),
            last_modified: Utc::now(),
        };

        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), object);
        debug!("Stored {} with etag {}", path, etag);
        etag
    }

    /// Make the next `count` calls to `get_object` fail with a backend error
    pub fn fail_next_gets(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of `get_object_metadata` calls served
    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_object` calls served (including failed ones)
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, path: &str) -> CacheResult<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| CacheError::ObjectNotFound(path.to_string()))
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_object_metadata(&self, path: &str) -> CacheResult<ObjectMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let object = self.lookup(path)?;

        Ok(ObjectMetadata {
            key: path.to_string(),
            content_length: object.data.len() as u64,
            etag: Some(object.etag),
            last_modified: object.last_modified,
        })
    }

    async fn get_object(&self, path: &str, range: Option<Range>) -> CacheResult<Vec<u8>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.take_failure() {
            return Err(CacheError::backend(path, "injected failure"));
        }

        let object = self.lookup(path)?;
        let len = object.data.len() as u64;

        let bytes = match range {
            None => object.data,
            Some(range) => {
                let range = range.clamp_to(len);
                let start = range.offset as usize;
                object.data[start..start + range.size as usize].to_vec()
            }
        };
        Ok(bytes)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
