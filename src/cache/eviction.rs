//! Size-bounded eviction
//!
//! A refresh scans the whole cache location (every profile), drops leftovers
//! of crashed writers, and removes entries in policy order until the
//! footprint is within `cache.size`. Only one process refreshes a location
//! at a time; the others skip their turn.

use crate::cache::lock::{self, EntryLock};
use crate::cache::sidecar::{self, json_sidecar_path};
use crate::cache::store::{LOCK_SUFFIX, TEMP_SUFFIX};
use crate::cache::usage::CacheUsage;
use crate::config::{CacheConfig, EvictionPolicyKind};
use crate::error::{CacheError, CacheResult};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Lock file serializing refreshes of one cache location
pub const REFRESH_LOCK_NAME: &str = ".cache_refresh.lock";

/// One entry found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// Physical path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last read
    pub accessed: SystemTime,
    /// When the entry was published
    pub created: SystemTime,
}

/// Order in which entries are evicted
pub trait EvictionPolicy: Send + Sync {
    /// Policy name as written in configuration
    fn name(&self) -> &'static str;

    /// Sort `files` so the first element is evicted first
    fn order(&self, files: &mut [CachedFile]);

    /// Whether this policy ever removes entries
    fn evicts(&self) -> bool {
        true
    }
}

/// Least recently read first
#[derive(Debug, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn order(&self, files: &mut [CachedFile]) {
        files.sort_by(|a, b| a.accessed.cmp(&b.accessed).then_with(|| a.path.cmp(&b.path)));
    }
}

/// Oldest entry first
#[derive(Debug, Default)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(&self, files: &mut [CachedFile]) {
        files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
    }
}

/// Uniformly random
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl EvictionPolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn order(&self, files: &mut [CachedFile]) {
        files.shuffle(&mut rand::thread_rng());
    }
}

/// Never evicts; the size limit is advisory
#[derive(Debug, Default)]
pub struct NoEvictionPolicy;

impl EvictionPolicy for NoEvictionPolicy {
    fn name(&self) -> &'static str {
        "no_eviction"
    }

    fn order(&self, _files: &mut [CachedFile]) {}

    fn evicts(&self) -> bool {
        false
    }
}

/// Policy implementation for a configured kind
pub fn policy_for(kind: EvictionPolicyKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruPolicy),
        EvictionPolicyKind::Fifo => Box::new(FifoPolicy),
        EvictionPolicyKind::Random => Box::new(RandomPolicy),
        EvictionPolicyKind::NoEviction => Box::new(NoEvictionPolicy),
    }
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Entries found
    pub scanned: usize,
    /// Bytes held before eviction
    pub total_bytes: u64,
    /// Entries removed
    pub evicted: usize,
    /// Bytes removed
    pub evicted_bytes: u64,
    /// Bytes held afterwards
    pub remaining_bytes: u64,
    /// Stale lock, temp and sidecar files removed
    pub orphans_removed: usize,
}

/// Result of walking the cache location
#[derive(Debug, Default)]
struct Scan {
    entries: Vec<CachedFile>,
    orphans_removed: usize,
}

/// Enforces the size limit of a cache location
pub struct EvictionManager {
    location: PathBuf,
    size_limit: u64,
    policy: Box<dyn EvictionPolicy>,
    refresh_interval: Duration,
    grace_period: Duration,
    last_refresh: Mutex<Instant>,
}

impl std::fmt::Debug for EvictionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionManager")
            .field("location", &self.location)
            .field("size_limit", &self.size_limit)
            .field("policy", &self.policy.name())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl EvictionManager {
    /// Create a manager for the location described by `config`
    pub fn new(config: &CacheConfig) -> Self {
        let grace_period = config
            .lock_timeout()
            .unwrap_or(Duration::from_secs(crate::config::schema::DEFAULT_LOCK_TIMEOUT_SECS));

        Self {
            location: config.location.clone(),
            size_limit: config.size_bytes(),
            policy: policy_for(config.eviction_policy.policy),
            refresh_interval: config.eviction_policy.refresh_interval(),
            grace_period,
            last_refresh: Mutex::new(Instant::now()),
        }
    }

    /// Age after which unheld lock files and temp files count as orphans
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Name of the active policy
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Seconds between refreshes
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Claim the next periodic refresh if the interval has elapsed
    pub fn claim_refresh_slot(&self) -> bool {
        let mut last = self
            .last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.elapsed() >= self.refresh_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Current footprint of the location, without modifying anything
    pub async fn usage(&self) -> CacheResult<CacheUsage> {
        let scan = self.scan(false).await?;
        Ok(CacheUsage {
            entries: scan.entries.len(),
            total_bytes: scan.entries.iter().map(|e| e.size).sum(),
            limit_bytes: self.size_limit,
        })
    }

    /// Run one refresh cycle
    ///
    /// Returns `None` when another process is already refreshing this location.
    pub async fn refresh_cache(&self) -> CacheResult<Option<RefreshReport>> {
        fs::create_dir_all(&self.location).await.map_err(|e| {
            CacheError::io(format!("creating {}", self.location.display()), e)
        })?;

        let Some(refresh_lock) =
            EntryLock::try_acquire(&self.location.join(REFRESH_LOCK_NAME)).await?
        else {
            debug!("Refresh of {} already in progress", self.location.display());
            return Ok(None);
        };

        let outcome = self.refresh_locked().await;
        refresh_lock.release().await;
        outcome.map(Some)
    }

    /// Refresh cycle body, run while the refresh lock is held
    async fn refresh_locked(&self) -> CacheResult<RefreshReport> {
        let Scan {
            mut entries,
            orphans_removed,
        } = self.scan(true).await?;

        let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
        let mut report = RefreshReport {
            scanned: entries.len(),
            total_bytes,
            remaining_bytes: total_bytes,
            orphans_removed,
            ..Default::default()
        };

        if total_bytes > self.size_limit && self.policy.evicts() {
            self.policy.order(&mut entries);

            for entry in &entries {
                if report.remaining_bytes <= self.size_limit {
                    break;
                }
                match remove_entry_file(&entry.path).await {
                    Ok(()) => {
                        report.evicted += 1;
                        report.evicted_bytes += entry.size;
                        report.remaining_bytes -= entry.size;
                        debug!("Evicted {}", entry.path.display());
                    }
                    Err(e) => warn!("Failed to evict {}: {}", entry.path.display(), e),
                }
            }
        }

        if report.evicted > 0 || report.orphans_removed > 0 {
            info!(
                "Cache refresh ({}): evicted {} entries ({} bytes), removed {} orphans, {} bytes remain",
                self.policy.name(),
                report.evicted,
                report.evicted_bytes,
                report.orphans_removed,
                report.remaining_bytes
            );
        } else {
            debug!(
                "Cache refresh ({}): {} entries, {} bytes",
                self.policy.name(),
                report.scanned,
                report.total_bytes
            );
        }
        Ok(report)
    }

    /// Walk the location, collecting entries and optionally cleaning orphans
    async fn scan(&self, clean: bool) -> CacheResult<Scan> {
        let mut scan = Scan::default();
        let mut pending = vec![self.location.clone()];

        while let Some(dir) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(CacheError::io(format!("scanning {}", dir.display()), e)),
            };

            while let Some(item) = reader
                .next_entry()
                .await
                .map_err(|e| CacheError::io(format!("scanning {}", dir.display()), e))?
            {
                let path = item.path();
                let metadata = match fs::symlink_metadata(&path).await {
                    Ok(metadata) => metadata,
                    // Removed between listing and stat
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!("Skipping {}: {}", path.display(), e);
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }

                let name = item.file_name().to_string_lossy().into_owned();
                if name == REFRESH_LOCK_NAME {
                    continue;
                }
                if name.ends_with(LOCK_SUFFIX) {
                    if clean && self.remove_stale_lock(&path).await {
                        scan.orphans_removed += 1;
                    }
                    continue;
                }
                if name.ends_with(TEMP_SUFFIX) {
                    if clean && self.remove_orphan_temp(&path, &metadata).await {
                        scan.orphans_removed += 1;
                    }
                    continue;
                }
                if sidecar::is_sidecar_file(&name) {
                    if clean && remove_orphan_sidecar(&path).await {
                        scan.orphans_removed += 1;
                    }
                    continue;
                }

                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                scan.entries.push(CachedFile {
                    path,
                    size: metadata.len(),
                    accessed: metadata.accessed().unwrap_or(modified),
                    created: metadata.created().unwrap_or(modified),
                });
            }
        }

        Ok(scan)
    }

    async fn remove_stale_lock(&self, path: &Path) -> bool {
        match lock::try_remove_stale(path, self.grace_period).await {
            Ok(removed) => {
                if removed {
                    debug!("Removed stale lock {}", path.display());
                }
                removed
            }
            Err(e) => {
                warn!("Failed to clean lock {}: {}", path.display(), e);
                false
            }
        }
    }

    async fn remove_orphan_temp(&self, path: &Path, metadata: &std::fs::Metadata) -> bool {
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age < self.grace_period {
            return false;
        }

        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed orphaned temp file {}", path.display());
                true
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
                false
            }
        }
    }
}

/// Remove a JSON sidecar whose entry no longer exists
async fn remove_orphan_sidecar(path: &Path) -> bool {
    let Some(entry) = path
        .to_str()
        .and_then(|p| p.strip_suffix(sidecar::META_SUFFIX))
        .map(PathBuf::from)
    else {
        return false;
    };

    if fs::symlink_metadata(&entry).await.is_ok() {
        return false;
    }
    fs::remove_file(path).await.is_ok()
}

/// Delete an entry together with its JSON sidecar, if any
async fn remove_entry_file(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::io(format!("removing {}", path.display()), e)),
    }

    match fs::remove_file(json_sidecar_path(path)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(format!("removing sidecar of {}", path.display()), e)),
    }
}
