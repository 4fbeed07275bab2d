//! Read path of the cache
//!
//! [`CacheManager::read`] decides, per request, between the full-file path
//! and the chunked path, serves fresh entries without touching the network,
//! and hands misses to the [`DownloadCoordinator`].

use crate::cache::addressing::ChunkAddressing;
use crate::cache::coordinator::{DownloadCoordinator, Fetched};
use crate::cache::eviction::{EvictionManager, RefreshReport};
use crate::cache::sidecar::{self, EntryMetadata};
use crate::cache::store::{CacheFileStore, EntryKind};
use crate::cache::usage::CacheUsage;
use crate::cache::validator::{ChunkExpectation, SourceVersionValidator, Verdict};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::storage::{ObjectMetadata, Range, SourceVersionCheckMode, StorageBackend};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Chunks of one request resolved at the same time
const CHUNK_CONCURRENCY: usize = 8;

/// Shortest period of the background refresh task
const MIN_REFRESH_PERIOD: Duration = Duration::from_secs(1);

/// Disk cache in front of a storage backend
pub struct CacheManager {
    config: CacheConfig,
    backend: Arc<dyn StorageBackend>,
    store: Arc<CacheFileStore>,
    addressing: ChunkAddressing,
    validator: SourceVersionValidator,
    coordinator: DownloadCoordinator,
    eviction: Arc<EvictionManager>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.store.root())
            .field("backend", &self.backend.backend_name())
            .field("cache_line_size", &self.addressing.line_size())
            .finish()
    }
}

impl CacheManager {
    /// Open the cache for `profile` in front of `backend`
    pub async fn new(
        config: CacheConfig,
        profile: &str,
        backend: Arc<dyn StorageBackend>,
    ) -> CacheResult<Self> {
        let addressing = ChunkAddressing::new(config.cache_line_bytes())?;
        let sidecar =
            sidecar::detect(&config.location, config.sidecar, config.require_xattr).await?;
        let store = Arc::new(CacheFileStore::new(&config.location, profile, sidecar)?);
        let coordinator = DownloadCoordinator::new(store.clone(), config.lock_timeout());
        let eviction = Arc::new(EvictionManager::new(&config));

        info!(
            "Cache at {} ({} sidecars, {} eviction, line {})",
            store.root().display(),
            store.sidecar().name(),
            eviction.policy_name(),
            config.cache_line_size
        );

        Ok(Self {
            validator: SourceVersionValidator::new(addressing.line_size()),
            config,
            backend,
            store,
            addressing,
            coordinator,
            eviction,
            refresh_task: Mutex::new(None),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// On-disk store of this profile
    pub fn store(&self) -> &CacheFileStore {
        &self.store
    }

    /// Eviction manager of the cache location
    pub fn eviction(&self) -> &EvictionManager {
        &self.eviction
    }

    /// Read `range` of `logical` (the whole object when `None`)
    ///
    /// The bytes returned equal an uncached read of the same range at the
    /// source version observed by this call.
    pub async fn read(
        &self,
        logical: &str,
        range: Option<Range>,
        mode: SourceVersionCheckMode,
    ) -> CacheResult<Vec<u8>> {
        if let Some(range) = range {
            if range.offset.checked_add(range.size).is_none() {
                return Err(CacheError::InvalidRange {
                    offset: range.offset,
                    size: range.size,
                });
            }
            if range.is_empty() {
                return Ok(Vec::new());
            }
        }
        self.store.physical_path_for(logical)?;

        if !mode.resolve(self.config.check_source_version) {
            return self.read_unversioned(logical, range).await;
        }

        let live = self.backend.get_object_metadata(logical).await?;
        let range = match range {
            Some(range) if !(range.offset == 0 && range.size >= live.content_length) => range,
            _ => return self.read_whole_file(logical, &live).await,
        };

        let range = range.clamp_to(live.content_length);
        if range.is_empty() {
            debug!("{} starts past the end of {}", range, logical);
            return Ok(Vec::new());
        }

        if let Some(bytes) = self.serve_full(logical, &live, Some(range)).await? {
            return Ok(bytes);
        }
        self.read_chunks(logical, range, Some(&live)).await
    }

    /// Run one eviction and cleanup cycle now
    pub async fn refresh_cache(&self) -> CacheResult<Option<RefreshReport>> {
        self.eviction.refresh_cache().await
    }

    /// Footprint of the whole cache location
    pub async fn usage(&self) -> CacheResult<CacheUsage> {
        self.eviction.usage().await
    }

    /// Remove every entry of this profile
    pub async fn clear(&self) -> CacheResult<()> {
        self.store.clear().await
    }

    /// Refresh every `refresh_interval` until the manager is dropped
    pub fn spawn_refresh_task(&self) -> CacheResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| CacheError::Internal(format!("no async runtime for refresh task: {e}")))?;

        let mut slot = self
            .refresh_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let eviction = self.eviction.clone();
        let period = eviction.refresh_interval().max(MIN_REFRESH_PERIOD);
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = eviction.refresh_cache().await {
                    warn!("Periodic cache refresh failed: {}", e);
                }
            }
        }));
        debug!("Started refresh task every {:?}", period);
        Ok(())
    }

    /// Full-object read with a version check
    async fn read_whole_file(&self, logical: &str, live: &ObjectMetadata) -> CacheResult<Vec<u8>> {
        if let Some(bytes) = self.serve_whole(logical, live).await? {
            return Ok(bytes);
        }

        let entry = self.store.entry_path(logical, EntryKind::Full)?;
        let bytes = self
            .coordinator
            .fetch_and_commit(
                logical,
                &entry,
                || self.serve_whole(logical, live),
                || async {
                    let bytes = self.backend.get_object(logical, None).await?;
                    check_length(logical, live.content_length, &bytes)?;
                    Ok::<_, CacheError>(Fetched::commit(
                        bytes,
                        EntryKind::Full,
                        self.full_metadata(live),
                    ))
                },
            )
            .await?;

        self.schedule_refresh();
        Ok(bytes)
    }

    /// Metadata for a full-file entry; small files also qualify as chunk 0
    fn full_metadata(&self, live: &ObjectMetadata) -> EntryMetadata {
        if self.addressing.covers_whole_file(live.content_length) {
            EntryMetadata::chunk(
                live.etag.clone(),
                self.addressing.line_size(),
                Some(live.content_length),
            )
        } else {
            EntryMetadata::full(live.etag.clone())
        }
    }

    /// The whole object from its full-file entry, or from a chunk 0 that spans it
    async fn serve_whole(
        &self,
        logical: &str,
        live: &ObjectMetadata,
    ) -> CacheResult<Option<Vec<u8>>> {
        if let Some(bytes) = self.serve_full(logical, live, None).await? {
            return Ok(Some(bytes));
        }

        match self.addressing.chunk_span(0, live.content_length) {
            Some(span) if span.size == live.content_length => {
                let expect = ChunkExpectation::Versioned { live, span };
                self.serve_chunk(logical, 0, expect).await
            }
            _ => Ok(None),
        }
    }

    /// Bytes of a fresh full-file entry, or `None` to force a miss
    async fn serve_full(
        &self,
        logical: &str,
        live: &ObjectMetadata,
        range: Option<Range>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let Some(stat) = self.store.entry_stat(logical, EntryKind::Full).await? else {
            return Ok(None);
        };

        if let Verdict::Stale(reason) = self.validator.check_full(&stat, live) {
            debug!("Full entry of {} is stale: {}", logical, reason);
            return Ok(None);
        }

        let expected = range.map_or(stat.len, |r| r.size);
        match self.store.read_entry_range(&stat.path, range).await? {
            Some(bytes) if bytes.len() as u64 == expected => {
                debug!("Served {} from full-file entry", logical);
                Ok(Some(bytes))
            }
            _ => {
                debug!("Full entry of {} vanished during read", logical);
                Ok(None)
            }
        }
    }

    /// Chunked read without contacting the source for metadata
    async fn read_unversioned(&self, logical: &str, range: Option<Range>) -> CacheResult<Vec<u8>> {
        if let Some(range) = range {
            return self.read_chunks(logical, range, None).await;
        }

        let line = self.addressing.line_size();
        let mut out = Vec::new();
        let mut index = 0;
        loop {
            let chunk = self.chunk_bytes(logical, index, None).await?;
            let len = chunk.len() as u64;
            out.extend_from_slice(&chunk);
            if len < line {
                if len == 0 && index > 0 {
                    let end = self.addressing.chunk_start(index)?;
                    self.record_end(logical, index - 1, end).await;
                }
                return Ok(out);
            }

            let end = self.addressing.chunk_start(index + 1)?;
            if self.recorded_total_size(logical, index).await? == Some(end) {
                return Ok(out);
            }
            index += 1;
        }
    }

    /// Logical file size recorded on chunk `index`, if any
    async fn recorded_total_size(&self, logical: &str, index: u64) -> CacheResult<Option<u64>> {
        for kind in chunk_kinds(index) {
            let Some(meta) = self.store.entry_metadata(logical, kind).await? else {
                continue;
            };
            if meta.cache_line_size == Some(self.addressing.line_size()) && meta.total_size.is_some()
            {
                return Ok(meta.total_size);
            }
        }
        Ok(None)
    }

    /// Mark chunk `index` as the last one when the object ends exactly at `end`
    async fn record_end(&self, logical: &str, index: u64, end: u64) {
        for kind in chunk_kinds(index) {
            match self.store.record_total_size(logical, kind, end).await {
                Ok(true) => {
                    debug!("{} ends at {} after chunk {}", logical, end, index);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to record size of {}: {}", logical, e),
            }
        }
    }

    /// Resolve the chunks covering `range` and stitch the requested bytes
    async fn read_chunks(
        &self,
        logical: &str,
        range: Range,
        live: Option<&ObjectMetadata>,
    ) -> CacheResult<Vec<u8>> {
        let slices = self.addressing.chunks_for(range)?;
        debug!("{} of {} spans {} chunks", range, logical, slices.len());

        let parts: Vec<Vec<u8>> = stream::iter(slices)
            .map(|slice| async move {
                let chunk = self.chunk_bytes(logical, slice.index, live).await?;
                let start = usize::try_from(slice.start).unwrap_or(usize::MAX).min(chunk.len());
                let end = usize::try_from(slice.start.saturating_add(slice.len))
                    .unwrap_or(usize::MAX)
                    .min(chunk.len());
                Ok::<_, CacheError>(chunk[start..end].to_vec())
            })
            .buffered(CHUNK_CONCURRENCY)
            .try_collect()
            .await?;

        let mut out = Vec::with_capacity(parts.iter().map(Vec::len).sum());
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    /// Whole content of chunk `index`, from cache or backend
    async fn chunk_bytes(
        &self,
        logical: &str,
        index: u64,
        live: Option<&ObjectMetadata>,
    ) -> CacheResult<Vec<u8>> {
        let expect = match live {
            Some(live) => {
                let span = self
                    .addressing
                    .chunk_span(index, live.content_length)
                    .ok_or_else(|| {
                        CacheError::Internal(format!(
                            "chunk {index} of {logical} lies past the end of the object"
                        ))
                    })?;
                ChunkExpectation::Versioned { live, span }
            }
            None => ChunkExpectation::Unversioned,
        };

        if let Some(bytes) = self.serve_chunk(logical, index, expect).await? {
            return Ok(bytes);
        }

        let entry = self.store.entry_path(logical, EntryKind::Chunk(index))?;

        let bytes = self
            .coordinator
            .fetch_and_commit(
                logical,
                &entry,
                || self.serve_chunk(logical, index, expect),
                || self.fetch_chunk(logical, index, expect),
            )
            .await?;

        self.schedule_refresh();
        Ok(bytes)
    }

    /// Bytes of a usable cached chunk, or `None` to force a miss
    ///
    /// A full-file entry of a small file also serves chunk 0.
    async fn serve_chunk(
        &self,
        logical: &str,
        index: u64,
        expect: ChunkExpectation<'_>,
    ) -> CacheResult<Option<Vec<u8>>> {
        for kind in chunk_kinds(index) {
            let Some(stat) = self.store.entry_stat(logical, kind).await? else {
                continue;
            };

            match self.validator.check_chunk(&stat, expect) {
                Verdict::Fresh => match self.store.read_entry_range(&stat.path, None).await? {
                    Some(bytes) if bytes.len() as u64 == stat.len => {
                        debug!("Served chunk {} of {} from cache", index, logical);
                        return Ok(Some(bytes));
                    }
                    _ => debug!("{} changed during read", stat.path.display()),
                },
                Verdict::Stale(reason) => {
                    debug!("{} not usable as chunk {}: {}", stat.path.display(), index, reason)
                }
            }
        }
        Ok(None)
    }

    /// Fetch chunk `index` from the backend along with its metadata
    async fn fetch_chunk(
        &self,
        logical: &str,
        index: u64,
        expect: ChunkExpectation<'_>,
    ) -> CacheResult<Fetched> {
        let line = self.addressing.line_size();

        match expect {
            ChunkExpectation::Versioned { live, span } => {
                let bytes = self.backend.get_object(logical, Some(span)).await?;
                check_length(logical, span.size, &bytes)?;

                let meta = EntryMetadata::chunk(live.etag.clone(), line, Some(live.content_length));
                Ok(Fetched::commit(bytes, EntryKind::Chunk(index), meta))
            }
            ChunkExpectation::Unversioned => {
                let start = self.addressing.chunk_start(index)?;
                let bytes = self
                    .backend
                    .get_object(logical, Some(Range::new(start, line)))
                    .await?;
                let len = bytes.len() as u64;

                if len == 0 {
                    return Ok(Fetched::uncached(bytes));
                }
                if len > line {
                    return Err(CacheError::ShortRead {
                        path: logical.to_string(),
                        expected: line,
                        actual: len,
                    });
                }

                let total = (len < line).then_some(start + len);
                Ok(Fetched::commit(
                    bytes,
                    EntryKind::Chunk(index),
                    EntryMetadata::chunk(None, line, total),
                ))
            }
        }
    }

    /// Start a background refresh if the interval has elapsed
    fn schedule_refresh(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if !self.eviction.claim_refresh_slot() {
            return;
        }

        let eviction = self.eviction.clone();
        handle.spawn(async move {
            if let Err(e) = eviction.refresh_cache().await {
                warn!("Background cache refresh failed: {}", e);
            }
        });
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let task = self
            .refresh_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Entries that may hold chunk `index`, in lookup order
fn chunk_kinds(index: u64) -> Vec<EntryKind> {
    if index == 0 {
        vec![EntryKind::Chunk(0), EntryKind::Full]
    } else {
        vec![EntryKind::Chunk(index)]
    }
}

fn check_length(logical: &str, expected: u64, bytes: &[u8]) -> CacheResult<()> {
    let actual = bytes.len() as u64;
    if actual == expected {
        Ok(())
    } else {
        Err(CacheError::ShortRead {
            path: logical.to_string(),
            expected,
            actual,
        })
    }
}
