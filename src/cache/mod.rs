//! Two-tier result cache
//!
//! Lookups go to an in-process hot map first and fall back to the durable
//! layer, promoting what they find. Both layers have their own byte ceiling
//! and eviction manager. Entries are handed out as `Arc<CacheEntry>`, so
//! evicting an entry never invalidates one a reader is still holding.

mod entry;
mod key;

pub use entry::{CacheEntry, CompiledArtifact, DependencyFingerprint};
pub use key::{derive_cache_key, CACHE_FORMAT_VERSION};

use crate::error::CompileCacheError;
use crate::eviction::{EvictionCandidate, EvictionConfig, EvictionManager};
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::storage::DurableStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

struct HotSlot {
    entry: Arc<CacheEntry>,
    inserted_at: i64,
    accessed_at: AtomicI64,
    access_count: AtomicU64,
}

impl HotSlot {
    fn candidate(&self, key: &Fingerprint) -> EvictionCandidate {
        EvictionCandidate {
            id: key.as_bytes().to_vec(),
            size: self.entry.size_bytes,
            accessed_at: self.accessed_at.load(Ordering::Relaxed),
            access_count: self.access_count.load(Ordering::Relaxed),
            created_at: self.inserted_at,
        }
    }
}

/// Lifetime counters for one cache instance
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hot_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts: AtomicU64,
    pub io_errors: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hot_hits.load(Ordering::Relaxed) + self.durable_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn io_errors(&self) -> u64 {
        self.io_errors.load(Ordering::Relaxed)
    }
}

/// Entries removed by one `evict_if_needed` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub hot_entries: u64,
    pub hot_bytes: u64,
    pub durable_entries: u64,
    pub durable_bytes: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.hot_entries == 0 && self.durable_entries == 0
    }
}

/// Bounded key→entry cache with a hot layer and an optional durable layer
pub struct ResultCache {
    hot: RwLock<HashMap<Fingerprint, HotSlot>>,
    hot_bytes: AtomicU64,
    clock: AtomicI64,
    durable: Option<Arc<dyn DurableStore>>,
    hot_eviction: EvictionManager,
    durable_eviction: EvictionManager,
    stats: CacheStats,
}

impl ResultCache {
    /// Hot layer only
    pub fn in_memory(hot: EvictionConfig) -> Self {
        Self::build(hot, EvictionConfig::default(), None)
    }

    /// Hot layer backed by a durable store
    pub fn with_durable(
        hot: EvictionConfig,
        durable: EvictionConfig,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self::build(hot, durable, Some(store))
    }

    fn build(
        hot: EvictionConfig,
        durable: EvictionConfig,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        Self {
            hot: RwLock::new(HashMap::new()),
            hot_bytes: AtomicU64::new(0),
            clock: AtomicI64::new(0),
            durable: store,
            hot_eviction: EvictionManager::new(services::RESULT_CACHE, hot),
            durable_eviction: EvictionManager::new(services::DURABLE_STORE, durable),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an entry, hot layer first
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        {
            let hot = self.hot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = hot.get(key) {
                slot.accessed_at.store(self.tick(), Ordering::Relaxed);
                slot.access_count.fetch_add(1, Ordering::Relaxed);
                self.stats.hot_hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    service = services::RESULT_CACHE,
                    operation = operations::GET,
                    status = status::HIT,
                    object_id = %key.short(),
                    "hot hit"
                );
                return Some(Arc::clone(&slot.entry));
            }
        }

        match self.durable_get(key) {
            Ok(Some(entry)) => {
                self.stats.durable_hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    service = services::DURABLE_STORE,
                    operation = operations::GET,
                    status = status::HIT,
                    object_id = %key.short(),
                    size_bytes = entry.size_bytes,
                    "durable hit, promoting"
                );
                Some(self.insert_hot(*key, entry))
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    service = services::RESULT_CACHE,
                    operation = operations::GET,
                    status = status::MISS,
                    object_id = %key.short(),
                    "cache miss"
                );
                None
            }
            Err(error) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.report_io_error(&error);
                None
            }
        }
    }

    fn durable_get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CompileCacheError> {
        let Some(store) = &self.durable else {
            return Ok(None);
        };

        let bytes = store
            .get(key.as_bytes())
            .map_err(|e| CompileCacheError::cache_io(operations::GET, &e))?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Unreadable entries are dropped so the next put replaces them
                let _ = store.delete(key.as_bytes());
                Err(CompileCacheError::cache_io(operations::GET, &e))
            }
        }
    }

    /// Store an entry in both layers.
    ///
    /// A durable write failure is logged and counted; the entry still lands
    /// in the hot layer.
    pub fn put(&self, key: Fingerprint, entry: CacheEntry) -> Arc<CacheEntry> {
        if let Some(store) = &self.durable {
            let written = entry
                .to_bytes()
                .and_then(|bytes| store.put(key.as_bytes(), &bytes));
            if let Err(e) = written {
                self.report_io_error(&CompileCacheError::cache_io(operations::PUT, &e));
            }
        }

        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        debug!(
            service = services::RESULT_CACHE,
            operation = operations::PUT,
            status = status::SUCCESS,
            object_id = %key.short(),
            size_bytes = entry.size_bytes,
            "stored entry"
        );

        self.insert_hot(key, entry)
    }

    fn insert_hot(&self, key: Fingerprint, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let now = self.tick();
        let slot = HotSlot {
            entry: Arc::clone(&entry),
            inserted_at: now,
            accessed_at: AtomicI64::new(now),
            access_count: AtomicU64::new(0),
        };

        let mut hot = self.hot.write().unwrap_or_else(PoisonError::into_inner);
        self.hot_bytes
            .fetch_add(entry.size_bytes, Ordering::Relaxed);
        if let Some(previous) = hot.insert(key, slot) {
            self.hot_bytes
                .fetch_sub(previous.entry.size_bytes, Ordering::Relaxed);
        }

        entry
    }

    /// Drop an entry from both layers
    pub fn remove(&self, key: &Fingerprint) {
        self.remove_hot(key);
        if let Some(store) = &self.durable {
            if let Err(e) = store.delete(key.as_bytes()) {
                self.report_io_error(&CompileCacheError::cache_io("delete", &e));
            }
        }
    }

    fn remove_hot(&self, key: &Fingerprint) -> Option<u64> {
        let mut hot = self.hot.write().unwrap_or_else(PoisonError::into_inner);
        let removed = hot.remove(key)?;
        self.hot_bytes
            .fetch_sub(removed.entry.size_bytes, Ordering::Relaxed);
        Some(removed.entry.size_bytes)
    }

    /// Shrink any layer that is over its ceiling back to its target size
    pub fn evict_if_needed(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        self.evict_hot(&mut report);
        self.evict_durable(&mut report);
        report
    }

    fn evict_hot(&self, report: &mut EvictionReport) {
        let current = self.hot_bytes();
        if !self.hot_eviction.is_over_ceiling(current) {
            return;
        }

        let candidates: Vec<EvictionCandidate> = {
            let hot = self.hot.read().unwrap_or_else(PoisonError::into_inner);
            hot.iter().map(|(key, slot)| slot.candidate(key)).collect()
        };

        for victim in self.hot_eviction.plan(current, candidates).victims {
            let Ok(bytes) = <[u8; 32]>::try_from(victim.id.as_slice()) else {
                continue;
            };
            if let Some(size) = self.remove_hot(&Fingerprint::from(bytes)) {
                self.hot_eviction.record_evicted(size);
                report.hot_entries += 1;
                report.hot_bytes += size;
            }
        }
        self.hot_eviction.finish(report.hot_entries, report.hot_bytes);
    }

    fn evict_durable(&self, report: &mut EvictionReport) {
        let Some(store) = &self.durable else {
            return;
        };

        let current = match store.stats() {
            Ok(stats) => stats.total_bytes,
            Err(e) => {
                self.report_io_error(&CompileCacheError::cache_io(operations::EVICT, &e));
                return;
            }
        };
        if !self.durable_eviction.is_over_ceiling(current) {
            return;
        }

        let candidates = match store.eviction_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                self.report_io_error(&CompileCacheError::cache_io(operations::EVICT, &e));
                return;
            }
        };

        for victim in self.durable_eviction.plan(current, candidates).victims {
            match store.delete(&victim.id) {
                Ok(()) => {
                    self.durable_eviction.record_evicted(victim.size);
                    report.durable_entries += 1;
                    report.durable_bytes += victim.size;
                }
                Err(e) => {
                    self.report_io_error(&CompileCacheError::cache_io(operations::EVICT, &e))
                }
            }
        }
        self.durable_eviction
            .finish(report.durable_entries, report.durable_bytes);
    }

    fn report_io_error(&self, error: &CompileCacheError) {
        self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            service = services::DURABLE_STORE,
            status = status::ERROR,
            "{}, continuing without it",
            error
        );
    }

    /// Whether the hot layer holds `key`, without touching access tracking
    pub fn contains_hot(&self, key: &Fingerprint) -> bool {
        self.hot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Entries in the hot layer
    pub fn len(&self) -> usize {
        self.hot.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative byte cost of the hot layer
    pub fn hot_bytes(&self) -> u64 {
        self.hot_bytes.load(Ordering::Relaxed)
    }

    pub fn has_durable_layer(&self) -> bool {
        self.durable.is_some()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Entries evicted from either layer over the cache's lifetime
    pub fn evictions_total(&self) -> u64 {
        self.hot_eviction.stats().entries() + self.durable_eviction.stats().entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StorageStats};

    fn entry(code: &str) -> CacheEntry {
        CacheEntry::new(
            CompiledArtifact {
                source_path: "foo.ts".to_string(),
                output_path: "foo.js".to_string(),
                code: code.to_string(),
                source_map: None,
                bare: false,
                content_fingerprint: Fingerprint::of(code),
            },
            vec![],
            vec![],
        )
    }

    fn hot_config(max_size_bytes: u64) -> EvictionConfig {
        EvictionConfig {
            max_size_bytes,
            target_ratio: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_put_then_get() {
        let cache = ResultCache::in_memory(EvictionConfig::default());
        let key = Fingerprint::of("k");

        assert!(cache.get(&key).is_none());
        cache.put(key, entry("exports.foo = 1;"));

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.artifact.code, "exports.foo = 1;");
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.hot_bytes(), 16);
    }

    #[test]
    fn test_replacing_an_entry_keeps_byte_count() {
        let cache = ResultCache::in_memory(EvictionConfig::default());
        let key = Fingerprint::of("k");

        cache.put(key, entry("aaaa"));
        cache.put(key, entry("bb"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hot_bytes(), 2);
    }

    #[test]
    fn test_durable_hit_is_promoted() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let key = Fingerprint::of("k");

        let first = ResultCache::with_durable(
            EvictionConfig::default(),
            EvictionConfig::default(),
            Arc::clone(&store),
        );
        first.put(key, entry("exports.a = 1;"));

        // A new cache over the same store starts with an empty hot layer
        let second = ResultCache::with_durable(
            EvictionConfig::default(),
            EvictionConfig::default(),
            store,
        );
        assert!(!second.contains_hot(&key));

        let hit = second.get(&key).unwrap();
        assert_eq!(hit.artifact.code, "exports.a = 1;");
        assert!(second.contains_hot(&key));
        assert_eq!(second.stats().durable_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hot_eviction_oldest_unused_first() {
        let cache = ResultCache::in_memory(hot_config(10));
        let keys: Vec<Fingerprint> = (0..3).map(|i| Fingerprint::of(format!("k{}", i))).collect();

        cache.put(keys[0], entry("aaaa"));
        cache.put(keys[1], entry("bbbb"));
        cache.get(&keys[0]);
        cache.put(keys[2], entry("cccc"));

        let report = cache.evict_if_needed();

        assert_eq!(report.hot_entries, 1);
        assert!(cache.contains_hot(&keys[0]));
        assert!(!cache.contains_hot(&keys[1]));
        assert!(cache.contains_hot(&keys[2]));
        assert!(cache.hot_bytes() <= 10);
        assert_eq!(cache.evictions_total(), 1);
    }

    #[test]
    fn test_evicted_entry_stays_valid_for_reader() {
        let cache = ResultCache::in_memory(hot_config(3));
        let key = Fingerprint::of("k");

        cache.put(key, entry("abcd"));
        let held = cache.get(&key).unwrap();
        cache.evict_if_needed();

        assert!(cache.get(&key).is_none());
        assert_eq!(held.artifact.code, "abcd");
    }

    #[test]
    fn test_durable_eviction() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::with_durable(
            EvictionConfig::default(),
            hot_config(8),
            Arc::clone(&store) as Arc<dyn DurableStore>,
        );

        for i in 0..4 {
            cache.put(Fingerprint::of(format!("k{}", i)), entry("abcd"));
        }

        let report = cache.evict_if_needed();

        assert!(report.durable_entries >= 1);
        let stats: StorageStats = store.stats().unwrap();
        assert!(stats.total_bytes <= 8);
    }

    struct BrokenStore;

    impl DurableStore for BrokenStore {
        fn put(&self, _id: &[u8], _data: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn get(&self, _id: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            anyhow::bail!("permission denied")
        }
        fn exists(&self, _id: &[u8]) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn delete(&self, _id: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn size(&self, _id: &[u8]) -> anyhow::Result<Option<u64>> {
            Ok(None)
        }
        fn stats(&self) -> anyhow::Result<StorageStats> {
            anyhow::bail!("unavailable")
        }
        fn eviction_candidates(&self) -> anyhow::Result<Vec<EvictionCandidate>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_durable_failures_degrade_to_miss() {
        let cache = ResultCache::with_durable(
            EvictionConfig::default(),
            EvictionConfig::default(),
            Arc::new(BrokenStore),
        );
        let key = Fingerprint::of("k");

        assert!(cache.get(&key).is_none());
        cache.put(key, entry("x"));
        assert!(cache.get(&key).is_some());
        cache.evict_if_needed();

        assert_eq!(cache.stats().io_errors(), 3);
    }

    #[test]
    fn test_corrupt_durable_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let key = Fingerprint::of("k");
        store.put(key.as_bytes(), b"not an entry").unwrap();

        let cache = ResultCache::with_durable(
            EvictionConfig::default(),
            EvictionConfig::default(),
            Arc::clone(&store) as Arc<dyn DurableStore>,
        );

        assert!(cache.get(&key).is_none());
        assert!(!store.exists(key.as_bytes()).unwrap());
    }
}
