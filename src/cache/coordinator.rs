//! Deduplicated download and commit of cache entries
//!
//! For one entry at a time: take the in-process mutex, then the cross-process
//! lock file, re-check whether a competitor already published the entry, and
//! only then call the backend. N concurrent misses on the same entry cost one
//! backend fetch; misses on different entries never contend.

use crate::cache::lock::{EntryLock, LockRegistry};
use crate::cache::sidecar::EntryMetadata;
use crate::cache::store::{CacheFileStore, EntryKind};
use crate::error::{CacheError, CacheResult};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where fetched bytes should be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Entry to write
    pub kind: EntryKind,
    /// Metadata to record alongside it
    pub meta: EntryMetadata,
}

/// Bytes returned by a backend fetch
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Payload handed back to the caller
    pub bytes: Vec<u8>,
    /// Publish instructions; `None` keeps the bytes out of the cache
    pub commit: Option<Commit>,
}

impl Fetched {
    /// Bytes to return and publish
    pub fn commit(bytes: Vec<u8>, kind: EntryKind, meta: EntryMetadata) -> Self {
        Self {
            bytes,
            commit: Some(Commit { kind, meta }),
        }
    }

    /// Bytes to return without caching
    pub fn uncached(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            commit: None,
        }
    }
}

/// Serializes fetches per entry across tasks and processes
#[derive(Debug)]
pub struct DownloadCoordinator {
    store: Arc<CacheFileStore>,
    registry: LockRegistry,
    lock_timeout: Option<Duration>,
}

impl DownloadCoordinator {
    /// Create a coordinator; `lock_timeout = None` waits forever
    pub fn new(store: Arc<CacheFileStore>, lock_timeout: Option<Duration>) -> Self {
        Self {
            store,
            registry: LockRegistry::new(),
            lock_timeout,
        }
    }

    /// Fetch an entry once and publish it
    ///
    /// `entry` is the physical path whose `.lock` guards the download.
    /// `lookup` runs under the lock and returns the bytes if a competitor
    /// already published a usable entry. Otherwise `fetch` is called and its
    /// result committed. Backend errors propagate; the lock is released on
    /// every path.
    pub async fn fetch_and_commit<L, LF, F, FF>(
        &self,
        logical: &str,
        entry: &Path,
        lookup: L,
        fetch: F,
    ) -> CacheResult<Vec<u8>>
    where
        L: FnOnce() -> LF,
        LF: Future<Output = CacheResult<Option<Vec<u8>>>>,
        F: FnOnce() -> FF,
        FF: Future<Output = CacheResult<Fetched>>,
    {
        let lock_path = CacheFileStore::lock_path(entry);
        let started = Instant::now();

        let local = self.registry.handle(&lock_path);
        let _local_guard = match self.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, local.lock_owned())
                .await
                .map_err(|_| CacheError::LockTimeout {
                    path: lock_path.clone(),
                    waited: started.elapsed(),
                })?,
            None => local.lock_owned().await,
        };

        let remaining = self
            .lock_timeout
            .map(|limit| limit.saturating_sub(started.elapsed()));
        let file_guard = EntryLock::acquire(&lock_path, remaining)
            .await
            .map_err(|e| match e {
                CacheError::LockTimeout { path, .. } => CacheError::LockTimeout {
                    path,
                    waited: started.elapsed(),
                },
                other => other,
            })?;

        let outcome = self.fill(logical, entry, lookup, fetch).await;
        file_guard.release().await;
        outcome
    }

    /// Lookup, fetch and commit while the entry lock is held
    async fn fill<L, LF, F, FF>(
        &self,
        logical: &str,
        entry: &Path,
        lookup: L,
        fetch: F,
    ) -> CacheResult<Vec<u8>>
    where
        L: FnOnce() -> LF,
        LF: Future<Output = CacheResult<Option<Vec<u8>>>>,
        F: FnOnce() -> FF,
        FF: Future<Output = CacheResult<Fetched>>,
    {
        if let Some(bytes) = lookup().await? {
            debug!("{} was filled by a concurrent download", entry.display());
            return Ok(bytes);
        }

        let fetched = fetch().await?;

        if let Some(commit) = &fetched.commit {
            match self
                .store
                .write_entry(logical, commit.kind, &fetched.bytes, &commit.meta)
                .await
            {
                Ok(_) => {}
                Err(e @ CacheError::XattrUnsupported { .. }) => return Err(e),
                Err(e) => warn!("Failed to cache {}: {}", entry.display(), e),
            }
        }

        Ok(fetched.bytes)
    }
}
