//! Eviction orderings
//!
//! - **LRU**: least recently used first; an entry never read since insertion
//!   keeps its insertion tick, so among those the oldest insertion goes first
//! - **LFU**: fewest reads first, ties broken by LRU order
//! - **FIFO**: oldest insertion first, regardless of use

/// One cache entry as seen by eviction.
///
/// Ticks are opaque: the hot layer uses a logical clock, the durable layer
/// Unix milliseconds. Only their relative order matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Cache key bytes
    pub id: Vec<u8>,
    /// Byte cost of the entry
    pub size: u64,
    pub accessed_at: i64,
    pub access_count: u64,
    pub created_at: i64,
}

/// Orders candidates, first element evicted first
pub trait EvictionPolicy: Send + Sync {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]);
}

#[derive(Debug, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        candidates.sort_by_key(|c| (c.accessed_at, c.created_at));
    }
}

#[derive(Debug, Default)]
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        candidates.sort_by_key(|c| (c.access_count, c.accessed_at, c.created_at));
    }
}

#[derive(Debug, Default)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        candidates.sort_by_key(|c| c.created_at);
    }
}
