//! On-disk layout of cache entries
//!
//! Logical paths are mirrored under `<location>/<profile>`:
//!
//! - full-file entry: `<root>/<dir>/<name>`
//! - chunk entry: `<root>/<dir>/.<name>#chunk<N>`
//! - download lock: `<entry>.lock`
//!
//! Entries are published with write-temp, fsync, rename, so readers only ever
//! observe complete files.

use crate::cache::sidecar::{self, EntryMetadata, SidecarStore};
use crate::error::{CacheError, CacheResult};
use crate::storage::Range;
use std::ffi::OsString;
use std::fs::{File, FileTimes};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Suffix of in-flight temporary files
pub const TEMP_SUFFIX: &str = ".chunkcache-tmp";

/// Suffix of download lock files
pub const LOCK_SUFFIX: &str = ".lock";

/// Which artifact of a logical file an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// The whole object
    Full,
    /// One cache line
    Chunk(u64),
}

/// An entry found on disk together with its recorded metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    /// Physical path
    pub path: PathBuf,
    /// Payload length in bytes
    pub len: u64,
    /// Sidecar metadata (default when nothing was recorded)
    pub meta: EntryMetadata,
}

/// Temporary sibling of `dest` in the same directory
pub(crate) fn temp_sibling(dest: &Path) -> PathBuf {
    let name = format!(".{}{}", uuid::Uuid::new_v4().simple(), TEMP_SUFFIX);
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Append `suffix` to the final component of `path`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Whether a file name is cache bookkeeping rather than an entry
pub fn is_internal_file(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX) || name.ends_with(TEMP_SUFFIX) || sidecar::is_sidecar_file(name)
}

/// File name of chunk `index` of a file called `basename`
pub fn chunk_file_name(basename: &str, index: u64) -> String {
    format!(".{}#chunk{}", basename, index)
}

/// Owner of the on-disk layout for one profile
#[derive(Debug)]
pub struct CacheFileStore {
    location: PathBuf,
    root: PathBuf,
    sidecar: Arc<dyn SidecarStore>,
}

impl CacheFileStore {
    /// Create a store for `profile` under the cache `location`
    pub fn new(
        location: impl Into<PathBuf>,
        profile: &str,
        sidecar: Arc<dyn SidecarStore>,
    ) -> CacheResult<Self> {
        if profile.is_empty()
            || profile == "."
            || profile == ".."
            || profile.contains('/')
            || profile.contains('\0')
        {
            return Err(CacheError::invalid_path(
                profile,
                "profile must be a single directory name",
            ));
        }

        let location = location.into();
        let root = location.join(profile);
        Ok(Self {
            location,
            root,
            sidecar,
        })
    }

    /// Cache location shared by all profiles
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Directory holding this profile's entries
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sidecar channel in use
    pub fn sidecar(&self) -> &Arc<dyn SidecarStore> {
        &self.sidecar
    }

    /// Mirror a logical path under the profile root
    ///
    /// Leading slashes and `.` components are dropped; `..` is rejected so
    /// the result never leaves the root.
    pub fn physical_path_for(&self, logical: &str) -> CacheResult<PathBuf> {
        let mut path = self.root.clone();
        let mut last = None;

        for component in logical.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    return Err(CacheError::invalid_path(
                        logical,
                        "parent directory components are not allowed",
                    ))
                }
                name if name.contains('\0') => {
                    return Err(CacheError::invalid_path(logical, "contains a NUL byte"))
                }
                name => {
                    path.push(name);
                    last = Some(name);
                }
            }
        }

        match last {
            None => Err(CacheError::invalid_path(logical, "path has no file name")),
            Some(name) if is_internal_file(name) => Err(CacheError::invalid_path(
                logical,
                "file name uses a suffix reserved for cache bookkeeping",
            )),
            Some(_) => Ok(path),
        }
    }

    /// Physical path of an entry
    pub fn entry_path(&self, logical: &str, kind: EntryKind) -> CacheResult<PathBuf> {
        let full = self.physical_path_for(logical)?;
        match kind {
            EntryKind::Full => Ok(full),
            EntryKind::Chunk(index) => {
                let basename = full
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| CacheError::invalid_path(logical, "path has no file name"))?;
                Ok(full.with_file_name(chunk_file_name(&basename, index)))
            }
        }
    }

    /// Lock file guarding downloads of `entry`
    pub fn lock_path(entry: &Path) -> PathBuf {
        with_suffix(entry, LOCK_SUFFIX)
    }

    /// Cached bytes of the full-file entry, if one exists
    ///
    /// Freshness is not checked.
    pub async fn read_full(&self, logical: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.entry_path(logical, EntryKind::Full)?;
        self.read_entry_range(&path, None).await
    }

    /// Cached bytes of chunk `index`, if present
    pub async fn read_chunk(&self, logical: &str, index: u64) -> CacheResult<Option<Vec<u8>>> {
        let path = self.entry_path(logical, EntryKind::Chunk(index))?;
        self.read_entry_range(&path, None).await
    }

    /// Read an entry (or part of it) and mark it as accessed
    ///
    /// Returns `None` when the file vanished, e.g. evicted concurrently.
    pub async fn read_entry_range(
        &self,
        path: &Path,
        range: Option<Range>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_and_touch(&path, range))
            .await
            .map_err(|e| CacheError::Internal(format!("cache read task failed: {e}")))?
    }

    /// Durably publish `bytes` as an entry with its metadata
    pub async fn write_entry(
        &self,
        logical: &str,
        kind: EntryKind,
        bytes: &[u8],
        meta: &EntryMetadata,
    ) -> CacheResult<PathBuf> {
        let dest = self.entry_path(logical, kind)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;
        }

        let temp = temp_sibling(&dest);
        if let Err(e) = self.publish(&temp, &dest, bytes, meta).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }

        self.sidecar.commit(&dest, meta).await?;
        debug!("Committed {} ({} bytes)", dest.display(), bytes.len());
        Ok(dest)
    }

    async fn publish(
        &self,
        temp: &Path,
        dest: &Path,
        bytes: &[u8],
        meta: &EntryMetadata,
    ) -> CacheResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(temp)
            .await
            .map_err(|e| CacheError::io(format!("creating {}", temp.display()), e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", temp.display()), e))?;
        if let Err(e) = file.sync_all().await {
            debug!("fsync of {} failed: {}", temp.display(), e);
        }
        drop(file);

        self.sidecar.stage(temp, dest, meta).await?;

        fs::rename(temp, dest).await.map_err(|e| {
            CacheError::io(
                format!("renaming {} to {}", temp.display(), dest.display()),
                e,
            )
        })
    }

    /// Recorded metadata of an entry, without reading its payload
    pub async fn entry_metadata(
        &self,
        logical: &str,
        kind: EntryKind,
    ) -> CacheResult<Option<EntryMetadata>> {
        let path = self.entry_path(logical, kind)?;
        Ok(self.stat_path(&path).await?.map(|stat| stat.meta))
    }

    /// Length and metadata of an entry, `None` when absent
    pub async fn entry_stat(&self, logical: &str, kind: EntryKind) -> CacheResult<Option<EntryStat>> {
        let path = self.entry_path(logical, kind)?;
        self.stat_path(&path).await
    }

    async fn stat_path(&self, path: &Path) -> CacheResult<Option<EntryStat>> {
        let metadata = match fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(format!("inspecting {}", path.display()), e)),
        };

        let meta = match self.sidecar.read(path).await {
            Ok(meta) => meta,
            Err(e @ CacheError::XattrUnsupported { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!("Treating {} as untracked: {}", path.display(), e);
                EntryMetadata::default()
            }
        };

        Ok(Some(EntryStat {
            path: path.to_path_buf(),
            len: metadata.len(),
            meta,
        }))
    }

    /// Record the logical file size on an entry that was published without one
    ///
    /// Returns whether the metadata changed.
    pub async fn record_total_size(
        &self,
        logical: &str,
        kind: EntryKind,
        total_size: u64,
    ) -> CacheResult<bool> {
        let path = self.entry_path(logical, kind)?;
        let Some(stat) = self.stat_path(&path).await? else {
            return Ok(false);
        };
        if stat.meta.total_size.is_some() {
            return Ok(false);
        }

        let meta = EntryMetadata {
            total_size: Some(total_size),
            ..stat.meta
        };
        self.sidecar.update(&path, &meta).await?;
        Ok(true)
    }

    /// Delete an entry and its sidecar
    pub async fn remove_entry(&self, logical: &str, kind: EntryKind) -> CacheResult<bool> {
        let path = self.entry_path(logical, kind)?;
        let removed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(CacheError::io(format!("removing {}", path.display()), e)),
        };
        self.sidecar.remove(&path).await?;
        Ok(removed)
    }

    /// Remove every entry of this profile
    pub async fn clear(&self) -> CacheResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!("Cleared {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(
                format!("clearing {}", self.root.display()),
                e,
            )),
        }
    }
}

fn read_and_touch(path: &Path, range: Option<Range>) -> CacheResult<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(format!("opening {}", path.display()), e)),
    };

    let mut buf = Vec::new();
    let result = match range {
        None => file.read_to_end(&mut buf).map(|_| ()),
        Some(range) => file
            .seek(SeekFrom::Start(range.offset))
            .and_then(|_| file.by_ref().take(range.size).read_to_end(&mut buf))
            .map(|_| ()),
    };
    result.map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;

    if let Err(e) = file.set_times(FileTimes::new().set_accessed(SystemTime::now())) {
        debug!("Could not update access time of {}: {}", path.display(), e);
    }
    Ok(Some(buf))
}
