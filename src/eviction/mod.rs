//! Size-bounded eviction
//!
//! Both cache layers carry a byte ceiling. Once the cumulative size of a
//! layer exceeds its ceiling, candidates are ordered by the configured policy
//! and removed until the layer is back at `target_ratio` of the ceiling:
//!
//! ```toml
//! [cache]
//! max_size = "10MB"
//! durable_max_size = "1GB"
//! eviction_policy = "lru"  # lru, lfu or fifo
//! target_ratio = 0.9
//! ```

use crate::logging::{operations, status};
use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

mod policy;

pub use policy::{EvictionCandidate, EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy};

const SIZE_UNITS: &[(&str, u64)] = &[
    ("TB", 1 << 40),
    ("GB", 1 << 30),
    ("MB", 1 << 20),
    ("KB", 1 << 10),
    ("B", 1),
];

/// Parse a size such as "10MB", "512kb" or a raw byte count
pub fn parse_size(raw: &str) -> Result<u64> {
    let normalized = raw.trim().to_uppercase();
    let (digits, multiplier) = SIZE_UNITS
        .iter()
        .find_map(|(suffix, multiplier)| {
            normalized
                .strip_suffix(suffix)
                .map(|digits| (digits, *multiplier))
        })
        .unwrap_or((normalized.as_str(), 1));

    let count: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Invalid size: {}", raw))?;
    count
        .checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", raw))
}

/// Ordering used to pick eviction victims
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicyType {
    Lru,
    Lfu,
    Fifo,
}

impl FromStr for EvictionPolicyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            _ => anyhow::bail!("Invalid eviction policy: {}. Must be lru, lfu, or fifo", s),
        }
    }
}

impl EvictionPolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
        }
    }

    fn order(&self, candidates: &mut [EvictionCandidate]) {
        match self {
            Self::Lru => LruPolicy.sort_candidates(candidates),
            Self::Lfu => LfuPolicy.sort_candidates(candidates),
            Self::Fifo => FifoPolicy.sort_candidates(candidates),
        }
    }
}

/// Ceiling and policy of one cache layer
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub max_size_bytes: u64,
    pub policy: EvictionPolicyType,
    /// Share of the ceiling to shrink back to once it is exceeded
    pub target_ratio: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 << 20,
            policy: EvictionPolicyType::Lru,
            target_ratio: 0.9,
        }
    }
}

impl EvictionConfig {
    pub fn parse_size(raw: &str) -> Result<u64> {
        parse_size(raw)
    }

    pub fn target_size_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.target_ratio) as u64
    }
}

/// Victims chosen for one layer, in eviction order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub victims: Vec<EvictionCandidate>,
    /// Sum of the victims' sizes
    pub bytes: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Lifetime counters of one layer's evictions
#[derive(Debug, Default)]
pub struct EvictionStats {
    runs: AtomicU64,
    entries: AtomicU64,
    bytes: AtomicU64,
}

impl EvictionStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Keeps one cache layer under its ceiling
pub struct EvictionManager {
    /// Service name the layer logs under
    layer: &'static str,
    config: EvictionConfig,
    stats: EvictionStats,
}

impl EvictionManager {
    pub fn new(layer: &'static str, config: EvictionConfig) -> Self {
        debug!(
            service = layer,
            policy = config.policy.as_str(),
            max_size_bytes = config.max_size_bytes,
            target_ratio = config.target_ratio,
            "eviction configured"
        );

        Self {
            layer,
            config,
            stats: EvictionStats::default(),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    pub fn stats(&self) -> &EvictionStats {
        &self.stats
    }

    pub fn is_over_ceiling(&self, current_bytes: u64) -> bool {
        current_bytes > self.config.max_size_bytes
    }

    /// Bytes to drop to get from `current_bytes` back to the target size
    pub fn excess_bytes(&self, current_bytes: u64) -> u64 {
        current_bytes.saturating_sub(self.config.target_size_bytes())
    }

    /// Pick victims among `candidates` for a layer currently holding
    /// `current_bytes`. Empty while the layer is at or under its ceiling.
    pub fn plan(&self, current_bytes: u64, mut candidates: Vec<EvictionCandidate>) -> EvictionPlan {
        if !self.is_over_ceiling(current_bytes) {
            return EvictionPlan::default();
        }

        let excess = self.excess_bytes(current_bytes);
        self.config.policy.order(&mut candidates);

        let mut plan = EvictionPlan::default();
        for candidate in candidates {
            if plan.bytes >= excess {
                break;
            }
            plan.bytes += candidate.size;
            plan.victims.push(candidate);
        }

        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        debug!(
            service = self.layer,
            operation = operations::EVICT,
            victims = plan.victims.len(),
            size_bytes = plan.bytes,
            excess_bytes = excess,
            "eviction planned"
        );

        plan
    }

    /// Count a victim that was actually removed
    pub fn record_evicted(&self, size: u64) {
        self.stats.entries.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Log the outcome of a run
    pub fn finish(&self, entries: u64, bytes: u64) {
        if entries > 0 {
            debug!(
                service = self.layer,
                operation = operations::EVICT,
                status = status::SUCCESS,
                evicted = entries,
                size_bytes = bytes,
                "eviction complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u8, size: u64, accessed_at: i64, created_at: i64) -> EvictionCandidate {
        EvictionCandidate {
            id: vec![id],
            size,
            accessed_at,
            access_count: 0,
            created_at,
        }
    }

    fn manager(max_size_bytes: u64, policy: EvictionPolicyType) -> EvictionManager {
        EvictionManager::new(
            "test",
            EvictionConfig {
                max_size_bytes,
                policy,
                target_ratio: 0.9,
            },
        )
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size(" 1gb ").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1TB").unwrap(), 1 << 40);
        assert_eq!(parse_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999TB").is_err());
    }

    #[test]
    fn test_policy_names() {
        assert_eq!("LRU".parse::<EvictionPolicyType>().unwrap(), EvictionPolicyType::Lru);
        assert_eq!("lfu".parse::<EvictionPolicyType>().unwrap(), EvictionPolicyType::Lfu);
        assert_eq!("Fifo".parse::<EvictionPolicyType>().unwrap(), EvictionPolicyType::Fifo);
        assert!("ttl".parse::<EvictionPolicyType>().is_err());
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let manager = manager(1000, EvictionPolicyType::Lru);

        assert!(!manager.is_over_ceiling(1000));
        assert!(manager.is_over_ceiling(1001));
        assert_eq!(manager.excess_bytes(900), 0);
        assert_eq!(manager.excess_bytes(1200), 300);
    }

    #[test]
    fn test_no_plan_under_ceiling() {
        let manager = manager(1000, EvictionPolicyType::Lru);
        let plan = manager.plan(1000, vec![candidate(1, 500, 0, 0)]);

        assert!(plan.is_empty());
        assert_eq!(manager.stats().runs(), 0);
    }

    #[test]
    fn test_lru_plan_covers_excess() {
        let manager = manager(250, EvictionPolicyType::Lru);
        let plan = manager.plan(
            300,
            vec![
                candidate(1, 100, 1000, 500),
                candidate(2, 100, 500, 400),
                candidate(3, 100, 2000, 600),
            ],
        );

        // 300 - 225 = 75 bytes to drop
        assert_eq!(plan.victims.len(), 1);
        assert_eq!(plan.victims[0].id, vec![2]);
        assert_eq!(plan.bytes, 100);
    }

    #[test]
    fn test_fifo_plan_ignores_access() {
        let manager = manager(100, EvictionPolicyType::Fifo);
        let plan = manager.plan(
            300,
            vec![
                candidate(1, 100, 10, 3),
                candidate(2, 100, 20, 1),
                candidate(3, 100, 30, 2),
            ],
        );

        let order: Vec<u8> = plan.victims.iter().map(|c| c.id[0]).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_record_evicted() {
        let manager = manager(100, EvictionPolicyType::Lru);
        manager.record_evicted(40);
        manager.record_evicted(60);

        assert_eq!(manager.stats().entries(), 2);
        assert_eq!(manager.stats().bytes(), 100);
    }
}
