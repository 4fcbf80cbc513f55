//! Splitting a batch into per-platform partitions
//!
//! Each platform tag in the batch gets its own [`Partition`]. Within it, units
//! are sorted into what gets compiled, what is published as a declaration,
//! what is only tracked (declarations owned by other packages), what is out of
//! scope for the platform and what was excluded by pattern.

use crate::dependencies::BatchIndex;
use crate::logging::{operations, services};
use crate::project::ProjectConfig;
use crate::unit::{Platform, SourceInput, SourceUnit};
use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use tracing::debug;

/// Appended after user patterns; cannot be overridden
pub const DEFAULT_EXCLUDES: &[&str] = &["node_modules/**", "**/node_modules/**"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Ordered exclusion patterns, first match wins
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    patterns: Vec<(String, Pattern)>,
}

impl ExclusionRules {
    pub fn new(user_patterns: &[String]) -> Result<Self> {
        let patterns = user_patterns
            .iter()
            .map(String::as_str)
            .chain(DEFAULT_EXCLUDES.iter().copied())
            .map(|raw| {
                Pattern::new(raw)
                    .map(|pattern| (raw.to_string(), pattern))
                    .with_context(|| format!("invalid exclude pattern: {}", raw))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// First pattern matching `path`.
    ///
    /// Patterns without a `/` are also tried against the file name, so
    /// `*.test.ts` excludes test files in any directory.
    pub fn matching(&self, path: &str) -> Option<&str> {
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.patterns
            .iter()
            .find(|(raw, pattern)| {
                pattern.matches_with(path, MATCH_OPTIONS)
                    || (!raw.contains('/') && pattern.matches_with(basename, MATCH_OPTIONS))
            })
            .map(|(raw, _)| raw.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// A unit dropped by an exclusion pattern
#[derive(Debug, Clone)]
pub struct ExcludedUnit {
    pub unit: SourceUnit,
    pub pattern: String,
}

/// Units of one platform for one cycle
#[derive(Debug, Clone)]
pub struct Partition {
    pub platform: Platform,
    /// Units handed to the transform on a miss
    pub compile: Vec<SourceUnit>,
    /// Application declarations, published as-is
    pub declarations: Vec<SourceUnit>,
    /// Declarations owned by a package: tracked, never compiled
    pub foreign_declarations: Vec<SourceUnit>,
    /// Declarations scoped to another kind of platform
    pub out_of_scope: Vec<SourceUnit>,
    pub excluded: Vec<ExcludedUnit>,
}

impl Partition {
    fn new(platform: Platform) -> Self {
        Self {
            platform,
            compile: Vec::new(),
            declarations: Vec::new(),
            foreign_declarations: Vec::new(),
            out_of_scope: Vec::new(),
            excluded: Vec::new(),
        }
    }

    /// Everything the platform can see: compiled units and visible declarations
    pub fn visible_units(&self) -> impl Iterator<Item = &SourceUnit> {
        self.compile
            .iter()
            .chain(&self.declarations)
            .chain(&self.foreign_declarations)
    }

    /// Path → content index used for import resolution and dependency checks
    pub fn index(&self) -> BatchIndex {
        BatchIndex::from_units(self.visible_units())
    }

    /// Units that get an entry in the batch report
    pub fn unit_count(&self) -> usize {
        self.compile.len()
            + self.declarations.len()
            + self.foreign_declarations.len()
            + self.out_of_scope.len()
            + self.excluded.len()
    }
}

/// Partitions of one batch, ordered by platform tag
#[derive(Debug, Clone, Default)]
pub struct PartitionSet {
    partitions: BTreeMap<Platform, Partition>,
    /// Configuration units removed from the batch
    pub config_units: Vec<String>,
}

impl PartitionSet {
    pub fn get(&self, platform: &Platform) -> Option<&Partition> {
        self.partitions.get(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.partitions.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl IntoIterator for PartitionSet {
    type Item = Partition;
    type IntoIter = std::collections::btree_map::IntoValues<Platform, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_values()
    }
}

/// Splits batches by platform under one project configuration
#[derive(Debug, Clone)]
pub struct PlatformPartitioner {
    rules: ExclusionRules,
}

impl PlatformPartitioner {
    pub fn new(config: &ProjectConfig) -> Result<Self> {
        Ok(Self {
            rules: ExclusionRules::new(&config.exclude)?,
        })
    }

    pub fn rules(&self) -> &ExclusionRules {
        &self.rules
    }

    /// Split `units` into disjoint per-platform partitions, keeping batch order
    pub fn split(&self, units: &[SourceUnit]) -> PartitionSet {
        let mut set = PartitionSet::default();

        for unit in units {
            if unit.is_config() {
                set.config_units.push(unit.path().to_string());
                continue;
            }

            let partition = set
                .partitions
                .entry(unit.platform().clone())
                .or_insert_with(|| Partition::new(unit.platform().clone()));

            if let Some(pattern) = self.rules.matching(unit.path()) {
                debug!(
                    service = services::PARTITIONER,
                    operation = operations::PARTITION,
                    path = unit.path(),
                    pattern,
                    "unit excluded"
                );
                partition.excluded.push(ExcludedUnit {
                    unit: unit.clone(),
                    pattern: pattern.to_string(),
                });
                continue;
            }

            if !unit.is_declaration() {
                partition.compile.push(unit.clone());
            } else if !unit.platform().can_see(unit.path()) {
                partition.out_of_scope.push(unit.clone());
            } else if unit.is_package_unit() {
                partition.foreign_declarations.push(unit.clone());
            } else {
                partition.declarations.push(unit.clone());
            }
        }

        for partition in set.partitions.values() {
            debug!(
                service = services::PARTITIONER,
                operation = operations::PARTITION,
                platform = %partition.platform,
                compile = partition.compile.len(),
                declarations = partition.declarations.len(),
                foreign_declarations = partition.foreign_declarations.len(),
                excluded = partition.excluded.len(),
                "partitioned"
            );
        }

        set
    }
}

/// Split `units` by platform under `config`
pub fn partition(units: &[SourceUnit], config: &ProjectConfig) -> Result<PartitionSet> {
    Ok(PlatformPartitioner::new(config)?.split(units))
}
