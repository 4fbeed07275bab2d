//! Sidecar metadata for cache entries
//!
//! Every entry records the source version it was fetched at and, for chunks,
//! the cache line size and logical file size it was cut with. The preferred
//! channel is `user.*` extended attributes on the entry itself; filesystems
//! without them fall back to an adjacent `<entry>.meta.json` file.

use crate::config::SidecarMode;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Extended attribute names
pub mod attrs {
    /// Source version token
    pub const ETAG: &str = "user.etag";
    /// Cache line size the chunk was cut with (decimal bytes)
    pub const CACHE_LINE_SIZE: &str = "user.cache_line_size";
    /// Logical file size (decimal bytes)
    pub const SIZE: &str = "user.size";
}

/// Suffix of JSON sidecar files
pub const META_SUFFIX: &str = ".meta.json";

/// Version information recorded with an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Source version at fetch time
    pub etag: Option<String>,
    /// Cache line size (chunk entries only)
    pub cache_line_size: Option<u64>,
    /// Logical file size (chunk entries only)
    pub total_size: Option<u64>,
}

impl EntryMetadata {
    /// Metadata for a full-file entry
    pub fn full(etag: Option<String>) -> Self {
        Self {
            etag,
            ..Default::default()
        }
    }

    /// Metadata for a chunk entry
    pub fn chunk(etag: Option<String>, cache_line_size: u64, total_size: Option<u64>) -> Self {
        Self {
            etag,
            cache_line_size: Some(cache_line_size),
            total_size,
        }
    }
}

/// Storage channel for entry metadata
#[async_trait]
pub trait SidecarStore: Send + Sync + fmt::Debug {
    /// Short name for logs and `stats`
    fn name(&self) -> &'static str;

    /// Attach metadata to a temporary file about to be published at `dest`
    async fn stage(&self, temp: &Path, dest: &Path, meta: &EntryMetadata) -> CacheResult<()>;

    /// Finish publishing after the data file was renamed to `entry`
    async fn commit(&self, entry: &Path, meta: &EntryMetadata) -> CacheResult<()>;

    /// Replace the metadata of an already published entry
    async fn update(&self, entry: &Path, meta: &EntryMetadata) -> CacheResult<()>;

    /// Read the metadata recorded for `entry`
    ///
    /// Missing attributes come back as `None` fields, never as an error.
    async fn read(&self, entry: &Path) -> CacheResult<EntryMetadata>;

    /// Drop the metadata recorded for `entry`
    async fn remove(&self, entry: &Path) -> CacheResult<()>;
}

/// Path of the JSON sidecar belonging to `entry`
pub fn json_sidecar_path(entry: &Path) -> PathBuf {
    let mut name = entry.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// Whether a file name belongs to a JSON sidecar
pub fn is_sidecar_file(name: &str) -> bool {
    name.ends_with(META_SUFFIX)
}

/// Pick a sidecar channel for the cache rooted at `root`
///
/// `Auto` probes extended attribute support once and falls back to JSON.
/// With `required`, missing attribute support is an error instead.
pub async fn detect(
    root: &Path,
    mode: SidecarMode,
    required: bool,
) -> CacheResult<Arc<dyn SidecarStore>> {
    match mode {
        SidecarMode::Json => {
            if required {
                debug!("require_xattr ignored for JSON sidecars");
            }
            Ok(Arc::new(JsonSidecar))
        }
        SidecarMode::Xattr => {
            if required && !probe_xattr(root).await? {
                return Err(CacheError::XattrUnsupported {
                    path: root.to_path_buf(),
                });
            }
            Ok(Arc::new(XattrSidecar::new(required)))
        }
        SidecarMode::Auto => {
            if probe_xattr(root).await? {
                debug!("Using xattr sidecars under {}", root.display());
                Ok(Arc::new(XattrSidecar::new(required)))
            } else if required {
                Err(CacheError::XattrUnsupported {
                    path: root.to_path_buf(),
                })
            } else {
                warn!(
                    "Extended attributes unsupported under {}, using JSON sidecars",
                    root.display()
                );
                Ok(Arc::new(JsonSidecar))
            }
        }
    }
}

/// Write and read back a probe attribute on a scratch file
async fn probe_xattr(root: &Path) -> CacheResult<bool> {
    if !xattr::SUPPORTED_PLATFORM {
        return Ok(false);
    }

    fs::create_dir_all(root)
        .await
        .map_err(|e| CacheError::io(format!("creating cache root {}", root.display()), e))?;

    let probe = root.join(format!(".xattr-probe-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&probe, b"")
        .await
        .map_err(|e| CacheError::io(format!("creating {}", probe.display()), e))?;

    let target = probe.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        xattr::set(&target, "user.chunkcache.probe", b"1")
            .and_then(|()| xattr::get(&target, "user.chunkcache.probe"))
    })
    .await
    .map_err(|e| CacheError::Internal(format!("xattr probe task failed: {e}")))?;

    let _ = fs::remove_file(&probe).await;

    match outcome {
        Ok(Some(value)) => Ok(value == b"1"),
        Ok(None) => Ok(false),
        Err(e) if is_unsupported(&e) => Ok(false),
        Err(e) => Err(CacheError::io(
            format!("probing extended attributes under {}", root.display()),
            e,
        )),
    }
}

/// Metadata kept in `user.*` extended attributes
#[derive(Debug, Clone)]
pub struct XattrSidecar {
    required: bool,
}

impl XattrSidecar {
    /// Create an xattr sidecar; `required` turns unsupported filesystems into errors
    pub fn new(required: bool) -> Self {
        Self { required }
    }

    fn unsupported(&self, path: &Path) -> CacheResult<()> {
        if self.required {
            Err(CacheError::XattrUnsupported {
                path: path.to_path_buf(),
            })
        } else {
            warn!(
                "Extended attributes unsupported at {}, entry left untracked",
                path.display()
            );
            Ok(())
        }
    }
}

#[async_trait]
impl SidecarStore for XattrSidecar {
    fn name(&self) -> &'static str {
        "xattr"
    }

    async fn stage(&self, temp: &Path, _dest: &Path, meta: &EntryMetadata) -> CacheResult<()> {
        let mut pairs: Vec<(&'static str, String)> = Vec::with_capacity(3);
        if let Some(etag) = &meta.etag {
            pairs.push((attrs::ETAG, etag.clone()));
        }
        if let Some(line) = meta.cache_line_size {
            pairs.push((attrs::CACHE_LINE_SIZE, line.to_string()));
        }
        if let Some(size) = meta.total_size {
            pairs.push((attrs::SIZE, size.to_string()));
        }

        let target = temp.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            pairs
                .iter()
                .try_for_each(|(name, value)| xattr::set(&target, name, value.as_bytes()))
        })
        .await
        .map_err(|e| CacheError::Internal(format!("xattr task failed: {e}")))?;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_unsupported(&e) => self.unsupported(temp),
            Err(e) => Err(CacheError::io(
                format!("setting attributes on {}", temp.display()),
                e,
            )),
        }
    }

    async fn commit(&self, _entry: &Path, _meta: &EntryMetadata) -> CacheResult<()> {
        // Attributes travel with the inode through the rename
        Ok(())
    }

    async fn update(&self, entry: &Path, meta: &EntryMetadata) -> CacheResult<()> {
        self.stage(entry, entry, meta).await
    }

    async fn read(&self, entry: &Path) -> CacheResult<EntryMetadata> {
        let target = entry.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            let etag = xattr::get(&target, attrs::ETAG)?;
            let line = xattr::get(&target, attrs::CACHE_LINE_SIZE)?;
            let size = xattr::get(&target, attrs::SIZE)?;
            Ok::<_, std::io::Error>((etag, line, size))
        })
        .await
        .map_err(|e| CacheError::Internal(format!("xattr task failed: {e}")))?;

        let (etag, line, size) = match result {
            Ok(values) => values,
            Err(e) if is_unsupported(&e) => {
                self.unsupported(entry)?;
                return Ok(EntryMetadata::default());
            }
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading attributes of {}", entry.display()),
                    e,
                ))
            }
        };

        Ok(EntryMetadata {
            etag: etag.map(|v| String::from_utf8_lossy(&v).into_owned()),
            cache_line_size: parse_decimal(entry, attrs::CACHE_LINE_SIZE, line)?,
            total_size: parse_decimal(entry, attrs::SIZE, size)?,
        })
    }

    async fn remove(&self, _entry: &Path) -> CacheResult<()> {
        Ok(())
    }
}

/// Whether an error means the filesystem has no xattr support
fn is_unsupported(err: &std::io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(|code| code == libc::ENOTSUP || code == libc::EOPNOTSUPP)
}

fn parse_decimal(entry: &Path, name: &str, raw: Option<Vec<u8>>) -> CacheResult<Option<u64>> {
    raw.map(|bytes| {
        String::from_utf8_lossy(&bytes)
            .trim()
            .parse::<u64>()
            .map_err(|_| CacheError::Sidecar {
                path: entry.to_path_buf(),
                reason: format!("{name} is not a decimal integer"),
            })
    })
    .transpose()
}

/// Metadata kept in `<entry>.meta.json`
#[derive(Debug, Clone, Default)]
pub struct JsonSidecar;

#[async_trait]
impl SidecarStore for JsonSidecar {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn stage(&self, _temp: &Path, dest: &Path, _meta: &EntryMetadata) -> CacheResult<()> {
        // A sidecar from the previous version must not describe the new bytes
        self.remove(dest).await
    }

    async fn commit(&self, entry: &Path, meta: &EntryMetadata) -> CacheResult<()> {
        let path = json_sidecar_path(entry);
        let temp = crate::cache::store::temp_sibling(&path);
        let content = serde_json::to_vec(meta)?;

        fs::write(&temp, content)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", temp.display()), e))?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::io(format!("publishing {}", path.display()), e));
        }
        Ok(())
    }

    async fn update(&self, entry: &Path, meta: &EntryMetadata) -> CacheResult<()> {
        self.commit(entry, meta).await
    }

    async fn read(&self, entry: &Path) -> CacheResult<EntryMetadata> {
        let path = json_sidecar_path(entry);
        match fs::read(&path).await {
            Ok(content) => {
                serde_json::from_slice(&content).map_err(|e| CacheError::Sidecar {
                    path,
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntryMetadata::default()),
            Err(e) => Err(CacheError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn remove(&self, entry: &Path) -> CacheResult<()> {
        let path = json_sidecar_path(entry);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(format!("removing {}", path.display()), e)),
        }
    }
}
