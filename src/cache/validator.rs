//! Source version checks for cached entries
//!
//! An entry is only served when everything it records still matches the live
//! object. A version bump therefore invalidates every entry of the file, even
//! the ones outside the requested range: each of them carries the old etag.

use crate::cache::store::EntryStat;
use crate::storage::{ObjectMetadata, Range};

/// Outcome of validating one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Safe to serve
    Fresh,
    /// Must be refetched
    Stale(&'static str),
}

impl Verdict {
    /// Whether the entry can be served
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// What a chunk entry has to match
#[derive(Debug, Clone, Copy)]
pub enum ChunkExpectation<'a> {
    /// Compared against the live object
    Versioned {
        /// Live metadata observed for this read
        live: &'a ObjectMetadata,
        /// Logical span the chunk must cover
        span: Range,
    },
    /// No live version available; only the chunk geometry is checked
    Unversioned,
}

/// Freshness rules for full-file and chunk entries
#[derive(Debug, Clone, Copy)]
pub struct SourceVersionValidator {
    cache_line_size: u64,
}

impl SourceVersionValidator {
    /// Validator for chunks cut with `cache_line_size`
    pub fn new(cache_line_size: u64) -> Self {
        Self { cache_line_size }
    }

    /// Whether a recorded etag matches the live one
    ///
    /// An entry without a recorded etag, or an object without one, is never fresh.
    pub fn is_fresh(cached: Option<&str>, live: Option<&str>) -> bool {
        matches!((cached, live), (Some(cached), Some(live)) if cached == live)
    }

    /// Check a full-file entry against the live object
    pub fn check_full(&self, stat: &EntryStat, live: &ObjectMetadata) -> Verdict {
        if !Self::is_fresh(stat.meta.etag.as_deref(), live.etag.as_deref()) {
            return Verdict::Stale("etag mismatch");
        }
        if stat.len != live.content_length {
            return Verdict::Stale("length differs from object size");
        }
        Verdict::Fresh
    }

    /// Check a chunk entry
    pub fn check_chunk(&self, stat: &EntryStat, expect: ChunkExpectation<'_>) -> Verdict {
        if stat.meta.cache_line_size != Some(self.cache_line_size) {
            return Verdict::Stale("cache line size changed");
        }

        match expect {
            ChunkExpectation::Versioned { live, span } => {
                if !Self::is_fresh(stat.meta.etag.as_deref(), live.etag.as_deref()) {
                    return Verdict::Stale("etag mismatch");
                }
                if stat.meta.total_size != Some(live.content_length) {
                    return Verdict::Stale("recorded file size differs");
                }
                if stat.len != span.size {
                    return Verdict::Stale("chunk length differs from its span");
                }
            }
            ChunkExpectation::Unversioned => {
                if stat.len == 0 || stat.len > self.cache_line_size {
                    return Verdict::Stale("chunk length out of bounds");
                }
            }
        }
        Verdict::Fresh
    }
}
