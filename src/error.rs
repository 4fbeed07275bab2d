//! Error types for chunkcache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum CacheError {
    // Backend errors
    #[error("Backend error for {path}: {reason}")]
    Backend { path: String, reason: String },

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Short read from backend for {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: String,
        expected: u64,
        actual: u64,
    },

    // Locking errors
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Sidecar metadata errors
    #[error("Extended attributes are not supported at {path}")]
    XattrUnsupported { path: PathBuf },

    #[error("Invalid sidecar metadata at {path}: {reason}")]
    Sidecar { path: PathBuf, reason: String },

    // Addressing errors
    #[error("Invalid logical path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid range: offset {offset}, size {size}")]
    InvalidRange { offset: u64, size: u64 },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid byte size: {0}")]
    InvalidSize(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a backend error for a logical path
    pub fn backend(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if the whole read can be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::LockTimeout { .. } | Self::ShortRead { .. }
        )
    }

    /// Whether this error is a lock wait timeout rather than a backend failure
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::XattrUnsupported { .. } => {
                Some("Set cache.require_xattr = false or cache.sidecar = \"json\"")
            }
            Self::LockTimeout { .. } => {
                Some("Another process is downloading this entry; retry or raise cache.lock_timeout")
            }
            Self::ConfigInvalid { .. } => Some("Run: chunkcache config show"),
            _ => None,
        }
    }
}
