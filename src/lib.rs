//! chunkcache - Partial-file disk cache for object storage
//!
//! Serves byte-range reads of remote objects from a local directory, caching
//! either whole files or fixed-size chunks and revalidating them against the
//! source etag. Designed to be shared by many tasks and processes pointed at
//! the same cache location.

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("chunkcache needs flock(2) and extended attributes; only Linux and macOS are supported");

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod storage;
pub mod ui;

pub use cache::CacheManager;
pub use error::{CacheError, CacheResult};
pub use storage::{MemoryBackend, ObjectMetadata, Range, SourceVersionCheckMode, StorageBackend};
