//! Download locks
//!
//! Two layers guard each entry. [`LockRegistry`] hands out one async mutex per
//! lock path so tasks of the same process queue without touching the
//! filesystem. [`EntryLock`] is an exclusive `flock(2)` on `<entry>.lock`
//! that coordinates with other processes sharing the cache directory.
//!
//! The lock file is unlinked before the flock is released. A waiter that
//! wins the flock on an already-unlinked inode notices the mismatch and
//! retries on a fresh file.

use crate::error::{CacheError, CacheResult};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Exclusive cross-process lock on a lock file
///
/// [`EntryLock::release`] unlinks the file and drops the flock. A guard that
/// is dropped instead (error paths, panics, cancelled futures) does the same
/// on the blocking pool.
#[derive(Debug)]
pub struct EntryLock {
    file: Option<File>,
    path: PathBuf,
}

impl EntryLock {
    /// Wait for the lock, giving up after `timeout` (`None` waits forever)
    pub async fn acquire(path: &Path, timeout: Option<Duration>) -> CacheResult<Self> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(lock) = Self::try_acquire(path).await? {
                return Ok(lock);
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(CacheError::LockTimeout {
                        path: path.to_path_buf(),
                        waited: started.elapsed(),
                    });
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Take the lock if nobody holds it
    pub async fn try_acquire(path: &Path) -> CacheResult<Option<Self>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::lock_now(path))
            .await
            .map_err(|e| CacheError::Internal(format!("lock task failed: {e}")))?
    }

    fn lock_now(path: PathBuf) -> CacheResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| CacheError::Lock {
                path: path.clone(),
                source: e,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Ok(None);
            }
            return Err(CacheError::Lock { path, source: e });
        }

        if !same_file(&file, &path) {
            debug!("Lock file {} was replaced, retrying", path.display());
            return Ok(None);
        }

        Ok(Some(Self {
            file: Some(file),
            path,
        }))
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the lock file and release the lock
    pub async fn release(mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        let path = self.path.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || unlock(&path, file)).await {
            warn!("Lock release task failed: {}", e);
        }
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || unlock(&path, file));
            }
            Err(_) => unlock(&path, file),
        }
    }
}

fn unlock(path: &Path, file: File) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove lock file {}: {}", path.display(), e);
        }
    }
    if let Err(e) = FileExt::unlock(&file) {
        debug!("Unlocking {} failed: {}", path.display(), e);
    }
}

/// Whether `file` is still the inode linked at `path`
fn same_file(file: &File, path: &Path) -> bool {
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

/// Remove a lock file left behind by a crashed process
///
/// Only files older than `grace` that nobody holds are removed.
pub async fn try_remove_stale(path: &Path, grace: Duration) -> CacheResult<bool> {
    let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CacheError::io(format!("inspecting {}", path.display()), e)),
    };

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < grace {
        return Ok(false);
    }

    match EntryLock::try_acquire(path).await? {
        Some(lock) => {
            lock.release().await;
            Ok(true)
        }
        None => Ok(false),
    }
}

type SharedMutex = tokio::sync::Mutex<()>;

/// In-process lock table, one async mutex per lock path
///
/// Owned by a cache manager and dropped with it. Entries are weak, so a path
/// nobody waits on costs nothing once its guard is gone.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Weak<SharedMutex>>>,
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex shared by every caller targeting `path`
    pub fn handle(&self, path: &Path) -> Arc<SharedMutex> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = locks.get(path).and_then(Weak::upgrade) {
            return existing;
        }

        if locks.len() >= 64 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        let fresh = Arc::new(SharedMutex::new(()));
        locks.insert(path.to_path_buf(), Arc::downgrade(&fresh));
        fresh
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
