//! Value types shared between the cache engine and storage backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte-range read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// First byte of the range
    pub offset: u64,
    /// Number of bytes requested
    pub size: u64,
}

impl Range {
    /// Create a new range
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Exclusive end offset, saturating at `u64::MAX`
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Whether the range selects no bytes
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Restrict the range to an object of `total_size` bytes
    pub fn clamp_to(&self, total_size: u64) -> Self {
        let offset = self.offset.min(total_size);
        let size = self.end().min(total_size) - offset;
        Self { offset, size }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Metadata the backend reports for an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Logical path of the object
    pub key: String,
    /// Object size in bytes
    pub content_length: u64,
    /// Opaque version token
    pub etag: Option<String>,
    /// When the object was last written
    pub last_modified: DateTime<Utc>,
}

/// Per-read override of `cache.check_source_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceVersionCheckMode {
    /// Use the configured value
    #[default]
    Inherit,
    /// Always compare cached etags with the source
    Enable,
    /// Never contact the source for metadata
    Disable,
}

impl SourceVersionCheckMode {
    /// Resolve against the configured default
    pub fn resolve(self, configured: bool) -> bool {
        match self {
            Self::Inherit => configured,
            Self::Enable => true,
            Self::Disable => false,
        }
    }
}
