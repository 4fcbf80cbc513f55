//! Dependency-aware invalidation
//!
//! After a unit compiles, its cache entry stores the direct references its
//! output declared, together with each reference's content fingerprint at
//! that moment. A later cache hit is only trusted if every reference stored
//! in that entry is still in the batch with the same fingerprint. The tracker
//! keeps the latest record per unit for reporting and is pruned of units
//! that leave the batch.
//!
//! Tracking is one level deep. A change further down the graph is caught
//! because the unit that directly references the changed file is recompiled
//! and re-declares its own references.

use crate::cache::{CacheEntry, DependencyFingerprint};
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::unit::{Platform, SourceInput, SourceUnit};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Identity of a compiled unit across cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub platform: Platform,
    pub path: String,
}

impl UnitKey {
    pub fn new(platform: &Platform, path: &str) -> Self {
        Self {
            platform: platform.clone(),
            path: path.to_string(),
        }
    }

    pub fn of<U: SourceInput + ?Sized>(unit: &U) -> Self {
        Self::new(unit.platform(), unit.path())
    }
}

#[derive(Debug, Clone)]
struct IndexedUnit {
    fingerprint: Fingerprint,
    contents: Arc<str>,
}

/// Path → content view of the units one partition can see in this cycle
#[derive(Debug, Clone, Default)]
pub struct BatchIndex {
    units: HashMap<String, IndexedUnit>,
}

impl BatchIndex {
    pub fn from_units<'a, I>(units: I) -> Self
    where
        I: IntoIterator<Item = &'a SourceUnit>,
    {
        let units = units
            .into_iter()
            .map(|unit| {
                (
                    unit.path().to_string(),
                    IndexedUnit {
                        fingerprint: unit.fingerprint(),
                        contents: unit.shared_contents(),
                    },
                )
            })
            .collect();
        Self { units }
    }

    pub fn fingerprint(&self, path: &str) -> Option<Fingerprint> {
        self.units.get(path).map(|u| u.fingerprint)
    }

    pub fn contents(&self, path: &str) -> Option<Arc<str>> {
        self.units.get(path).map(|u| Arc::clone(&u.contents))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.units.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Current fingerprints for `paths`, skipping paths not in the batch and
    /// repeats, in the order given
    pub fn snapshot<'a, I>(&self, paths: I) -> Vec<DependencyFingerprint>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        paths
            .into_iter()
            .filter(|path| seen.insert(*path))
            .filter_map(|path| {
                self.fingerprint(path).map(|fingerprint| DependencyFingerprint {
                    path: path.to_string(),
                    fingerprint,
                })
            })
            .collect()
    }
}

/// Result of checking a unit's recorded references against the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Every reference is present and unchanged
    Valid,
    /// Nothing recorded for this unit and source fingerprint
    Untracked,
    /// A reference's content changed
    Changed { path: String },
    /// A reference is no longer in the batch
    Missing { path: String },
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[derive(Debug, Clone)]
struct DependencyRecord {
    source: Fingerprint,
    dependencies: Vec<DependencyFingerprint>,
}

/// Per-unit record of direct references, owned by one engine instance
#[derive(Debug, Default)]
pub struct DependencyTracker {
    records: RwLock<HashMap<UnitKey, DependencyRecord>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the references of a freshly compiled unit
    pub fn record(&self, key: UnitKey, source: Fingerprint, dependencies: Vec<DependencyFingerprint>) {
        debug!(
            service = services::DEPENDENCIES,
            path = %key.path,
            platform = %key.platform,
            count = dependencies.len(),
            "recorded dependencies"
        );
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                DependencyRecord {
                    source,
                    dependencies,
                },
            );
    }

    /// Check recorded references for a unit whose content is `source`
    pub fn check(&self, key: &UnitKey, source: &Fingerprint, index: &BatchIndex) -> Validity {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        match records.get(key) {
            Some(record) if record.source == *source => Self::compare(&record.dependencies, index),
            _ => Validity::Untracked,
        }
    }

    /// Whether a cache hit for the unit can be trusted
    pub fn is_valid(&self, key: &UnitKey, source: &Fingerprint, index: &BatchIndex) -> bool {
        self.check(key, source, index).is_valid()
    }

    /// Check a cache entry about to be served.
    ///
    /// The entry's own dependency snapshot decides: one unit can have entries
    /// under several option sets, each built against different reference
    /// contents. A valid entry becomes the unit's record.
    pub fn validate_entry(&self, key: &UnitKey, entry: &CacheEntry, index: &BatchIndex) -> Validity {
        let validity = Self::compare(&entry.dependencies, index);

        if validity.is_valid() {
            self.record(key.clone(), entry.fingerprint, entry.dependencies.clone());
        } else {
            debug!(
                service = services::DEPENDENCIES,
                operation = operations::VALIDATE,
                status = status::STALE,
                path = %key.path,
                platform = %key.platform,
                reason = ?validity,
                "cached entry invalidated by dependency"
            );
        }

        validity
    }

    fn compare(dependencies: &[DependencyFingerprint], index: &BatchIndex) -> Validity {
        for dependency in dependencies {
            match index.fingerprint(&dependency.path) {
                Some(current) if current == dependency.fingerprint => {}
                Some(_) => {
                    return Validity::Changed {
                        path: dependency.path.clone(),
                    }
                }
                None => {
                    return Validity::Missing {
                        path: dependency.path.clone(),
                    }
                }
            }
        }
        Validity::Valid
    }

    /// Drop the record for a unit, e.g. after it failed to compile
    pub fn forget(&self, key: &UnitKey) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drop records for units not in `seen`, returning how many went
    pub fn retain(&self, seen: &HashSet<UnitKey>) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|key, _| seen.contains(key));
        let pruned = before - records.len();

        if pruned > 0 {
            debug!(
                service = services::DEPENDENCIES,
                pruned,
                remaining = records.len(),
                "pruned records of units that left the batch"
            );
        }
        pruned
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Recorded reference paths for a unit
    pub fn dependencies_of(&self, key: &UnitKey) -> Option<Vec<String>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|r| r.dependencies.iter().map(|d| d.path.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
