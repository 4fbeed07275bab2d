//! Storage capability consumed by the cache engine

mod backend;
pub mod memory;
mod types;

pub use backend::StorageBackend;
pub use memory::MemoryBackend;
pub use types::{ObjectMetadata, Range, SourceVersionCheckMode};
