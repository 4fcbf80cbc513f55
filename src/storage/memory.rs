use super::{DurableStore, StorageStats};
use crate::eviction::EvictionCandidate;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    created_at: i64,
    accessed_at: i64,
    access_count: u64,
}

/// Process-local durable layer.
///
/// Survives hot-layer eviction but not a restart. Used when the engine runs
/// without a cache directory and as a stand-in for the filesystem store in
/// tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Vec<u8>, StoredBlob>>,
    clock: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, id: &[u8], data: &[u8]) -> Result<()> {
        let now = self.tick();
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        let access_count = blobs.get(id).map(|b| b.access_count).unwrap_or(0);
        blobs.insert(
            id.to_vec(),
            StoredBlob {
                data: data.to_vec(),
                created_at: now,
                accessed_at: now,
                access_count,
            },
        );
        Ok(())
    }

    fn get(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let now = self.tick();
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get_mut(id).map(|blob| {
            blob.accessed_at = now;
            blob.access_count += 1;
            blob.data.clone()
        }))
    }

    fn exists(&self, id: &[u8]) -> Result<bool> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.contains_key(id))
    }

    fn delete(&self, id: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(id);
        Ok(())
    }

    fn size(&self, id: &[u8]) -> Result<Option<u64>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(id).map(|b| b.data.len() as u64))
    }

    fn stats(&self) -> Result<StorageStats> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(StorageStats {
            total_objects: blobs.len() as u64,
            total_bytes: blobs.values().map(|b| b.data.len() as u64).sum(),
            location: None,
        })
    }

    fn eviction_candidates(&self) -> Result<Vec<EvictionCandidate>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs
            .iter()
            .map(|(id, blob)| EvictionCandidate {
                id: id.clone(),
                size: blob.data.len() as u64,
                accessed_at: blob.accessed_at,
                access_count: blob.access_count,
                created_at: blob.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();

        store.put(b"k1", b"hello world").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"hello world".to_vec()));
        assert!(store.exists(b"k1").unwrap());
        assert_eq!(store.size(b"k1").unwrap(), Some(11));
        assert_eq!(store.get(b"missing").unwrap(), None);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_objects, 1);
        assert_eq!(stats.total_bytes, 11);

        store.delete(b"k1").unwrap();
        assert!(!store.exists(b"k1").unwrap());
        store.delete(b"k1").unwrap();
    }

    #[test]
    fn test_candidates_track_access() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"22").unwrap();
        store.get(b"a").unwrap();

        let mut candidates = store.eviction_candidates().unwrap();
        candidates.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(candidates[0].access_count, 1);
        assert!(candidates[0].accessed_at > candidates[1].accessed_at);
        assert_eq!(candidates[1].size, 2);
    }
}
