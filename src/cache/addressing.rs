//! Chunk addressing
//!
//! Maps byte offsets to cache-line indices. Chunk `N` covers
//! `[N * L, min((N + 1) * L, total_size))` where `L` is the cache line size.

use crate::error::{CacheError, CacheResult};
use crate::storage::Range;

/// Part of a request served by a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlice {
    /// Zero-based chunk index
    pub index: u64,
    /// Offset of the requested bytes inside the chunk
    pub start: u64,
    /// Number of requested bytes inside the chunk
    pub len: u64,
}

/// Cache-line arithmetic for one configured line size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAddressing {
    line_size: u64,
}

impl ChunkAddressing {
    /// Create addressing for a cache line of `line_size` bytes
    pub fn new(line_size: u64) -> CacheResult<Self> {
        if line_size == 0 {
            return Err(CacheError::InvalidSize(
                "cache line size must be greater than zero".to_string(),
            ));
        }
        Ok(Self { line_size })
    }

    /// Configured cache line size in bytes
    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    /// Index of the chunk holding `offset`
    pub fn chunk_index(&self, offset: u64) -> u64 {
        offset / self.line_size
    }

    /// First logical byte of chunk `index`
    pub fn chunk_start(&self, index: u64) -> CacheResult<u64> {
        index
            .checked_mul(self.line_size)
            .ok_or(CacheError::InvalidRange {
                offset: u64::MAX,
                size: self.line_size,
            })
    }

    /// Ordered chunks covering `range`, with the sub-span needed from each
    ///
    /// An empty range yields no chunks.
    pub fn chunks_for(&self, range: Range) -> CacheResult<Vec<ChunkSlice>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let end = range
            .offset
            .checked_add(range.size)
            .ok_or(CacheError::InvalidRange {
                offset: range.offset,
                size: range.size,
            })?;

        let first = self.chunk_index(range.offset);
        let last = self.chunk_index(end - 1);

        let slices = (first..=last)
            .map(|index| {
                // index <= (end - 1) / L, so this cannot overflow
                let chunk_start = index * self.line_size;
                let chunk_end = chunk_start.saturating_add(self.line_size);
                let from = range.offset.max(chunk_start);
                let to = end.min(chunk_end);
                ChunkSlice {
                    index,
                    start: from - chunk_start,
                    len: to - from,
                }
            })
            .collect();
        Ok(slices)
    }

    /// Logical span of chunk `index` in an object of `total_size` bytes
    ///
    /// Returns `None` when the chunk starts at or past the end of the object.
    pub fn chunk_span(&self, index: u64, total_size: u64) -> Option<Range> {
        let start = index.checked_mul(self.line_size)?;
        if start >= total_size {
            return None;
        }
        let end = start.saturating_add(self.line_size).min(total_size);
        Some(Range::new(start, end - start))
    }

    /// Whether chunk 0 alone spans an object of `total_size` bytes
    pub fn covers_whole_file(&self, total_size: u64) -> bool {
        total_size <= self.line_size
    }
}
