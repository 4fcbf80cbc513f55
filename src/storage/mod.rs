//! Durable key→bytes layer behind the result cache

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

use crate::eviction::EvictionCandidate;
use anyhow::Result;
use std::path::PathBuf;

/// Durable storage for serialized cache entries, keyed by fingerprint bytes
pub trait DurableStore: Send + Sync {
    /// Store a blob under `id`, replacing any previous blob
    fn put(&self, id: &[u8], data: &[u8]) -> Result<()>;

    /// Retrieve a blob by ID
    fn get(&self, id: &[u8]) -> Result<Option<Vec<u8>>>;

    fn exists(&self, id: &[u8]) -> Result<bool>;

    /// Delete a blob; deleting a missing blob is not an error
    fn delete(&self, id: &[u8]) -> Result<()>;

    /// Size of a blob in bytes
    fn size(&self, id: &[u8]) -> Result<Option<u64>>;

    /// Object count and approximate total size
    fn stats(&self) -> Result<StorageStats>;

    /// Every stored object with the metadata eviction policies need
    fn eviction_candidates(&self) -> Result<Vec<EvictionCandidate>>;
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_objects: u64,
    pub total_bytes: u64,
    /// Backing directory, if the store lives on disk
    pub location: Option<PathBuf>,
}
