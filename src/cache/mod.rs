//! Disk cache for byte-range reads against a storage backend
//!
//! Reads either go through a single full-file entry or are split into
//! fixed-size chunks, each cached independently. Every entry records the
//! source etag it was fetched at and is only served while that etag is
//! still current.
//!
//! # Entry States
//!
//! | State | On disk | Description |
//! |-------|---------|-------------|
//! | Untracked | nothing | Never fetched, or evicted |
//! | Fetching | `<entry>.lock` held | One task downloads, others wait |
//! | Fresh | entry + sidecar | Recorded etag equals the live one |
//! | Stale | entry + old sidecar | Source changed; refetched on next read |
//!
//! Entries are immutable once published: a refetch replaces the file with an
//! atomic rename rather than modifying it in place.

pub mod addressing;
pub mod coordinator;
pub mod eviction;
pub mod lock;
pub mod manager;
pub mod sidecar;
pub mod store;
pub mod usage;
pub mod validator;

pub use addressing::{ChunkAddressing, ChunkSlice};
pub use coordinator::{DownloadCoordinator, Fetched};
pub use eviction::{policy_for, CachedFile, EvictionManager, EvictionPolicy, RefreshReport};
pub use lock::{EntryLock, LockRegistry};
pub use manager::CacheManager;
pub use sidecar::{EntryMetadata, JsonSidecar, SidecarStore, XattrSidecar};
pub use store::{CacheFileStore, EntryKind, EntryStat};
pub use usage::{format_bytes, CacheSizeStatus, CacheUsage};
pub use validator::{SourceVersionValidator, Verdict};
