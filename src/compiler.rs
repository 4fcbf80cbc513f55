//! Build-cycle orchestration
//!
//! [`CompilationCache::process_batch`] runs one cycle:
//!
//! 1. refresh the project configuration from the batch (a failure aborts the
//!    cycle before anything else happens)
//! 2. split the batch by platform
//! 3. per partition, in parallel: resolve every unit to a hit or a miss,
//!    compile the misses with bounded concurrency, store what compiled
//! 4. publish one report per unit
//!
//! Cycles never overlap: the cycle lock is held from the refresh until the
//! report is returned.

use crate::cache::{derive_cache_key, CacheEntry, CompiledArtifact, ResultCache};
use crate::config::EngineConfig;
use crate::dependencies::{BatchIndex, DependencyTracker, UnitKey};
use crate::diagnostics::{
    self, Diagnostic, DiagnosticDeduplicator, DiagnosticKind, DiagnosticRecord, RawDiagnostic,
    Severity, TransformDiagnostics,
};
use crate::error::CompileCacheError;
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::partition::{Partition, PlatformPartitioner};
use crate::project::{CompilerOptions, ConfigStore, ProjectConfig, ReloadEvent};
use crate::storage::{DurableStore, FilesystemStore};
use crate::transform::{CompileRequest, ImportResolver, TranspileOutput, Transpiler};
use crate::typings::TypingsMaterializer;
use crate::unit::{Platform, SourceInput, SourceUnit, ROOT_CONFIG_PATH};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Compiled unit as published to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledUnit {
    pub artifact: CompiledArtifact,
    /// Soft warnings that survived deduplication
    pub warnings: Vec<Diagnostic>,
    pub cache_hit: bool,
}

/// Declaration published without compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclarationAsset {
    pub path: String,
    pub content_fingerprint: Fingerprint,
}

/// What happened to one unit in a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UnitOutcome {
    Compiled(CompiledUnit),
    /// Hard errors; no artifact is published
    Failed {
        errors: Vec<Diagnostic>,
        warnings: Vec<Diagnostic>,
    },
    Declaration(DeclarationAsset),
    /// Dropped by an exclusion pattern; never compiled
    Excluded { pattern: String },
    /// Package declaration: visible to the transform, never compiled
    TrackedOnly,
    /// Declaration scoped to another kind of platform
    OutOfScope,
}

impl UnitOutcome {
    pub fn artifact(&self) -> Option<&CompiledArtifact> {
        match self {
            Self::Compiled(unit) => Some(&unit.artifact),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn errors(&self) -> &[Diagnostic] {
        match self {
            Self::Failed { errors, .. } => errors,
            _ => &[],
        }
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        match self {
            Self::Compiled(unit) => &unit.warnings,
            Self::Failed { warnings, .. } => warnings,
            _ => &[],
        }
    }
}

/// Outcome of one unit on one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub platform: Platform,
    pub path: String,
    pub package_name: Option<String>,
    pub outcome: UnitOutcome,
}

/// Counters for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub hits: u64,
    pub misses: u64,
    /// Transform invocations
    pub compiled: u64,
    pub failed: u64,
    pub excluded: u64,
    pub declarations: u64,
    pub suppressed_warnings: u64,
    pub evicted: u64,
}

impl CycleStats {
    fn merge(&mut self, other: &CycleStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.compiled += other.compiled;
        self.failed += other.failed;
        self.excluded += other.excluded;
        self.declarations += other.declarations;
        self.suppressed_warnings += other.suppressed_warnings;
        self.evicted += other.evicted;
    }
}

/// Everything a cycle produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub cycle: u64,
    pub config_fingerprint: Fingerprint,
    /// Ordered by platform tag, then batch order
    pub units: Vec<UnitReport>,
    pub stats: CycleStats,
}

impl BatchReport {
    /// Published artifacts only
    pub fn artifacts(&self) -> impl Iterator<Item = &CompiledArtifact> {
        self.units.iter().filter_map(|u| u.outcome.artifact())
    }

    pub fn outcome(&self, platform: &str, path: &str) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|u| u.platform.as_str() == platform && u.path == path)
            .map(|u| &u.outcome)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.units.iter().flat_map(|u| u.outcome.errors())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.units.iter().flat_map(|u| u.outcome.warnings())
    }

    pub fn has_errors(&self) -> bool {
        self.units.iter().any(|u| u.outcome.is_failure())
    }
}

/// Lifetime counters of one engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub config_errors: u64,
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub failures: u64,
    pub evictions: u64,
    pub suppressed_warnings: u64,
    pub durable_io_errors: u64,
    /// Entries in the hot layer right now
    pub hot_entries: u64,
    pub hot_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    config_errors: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn record_cycle(&self, stats: &CycleStats) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(stats.hits, Ordering::Relaxed);
        self.misses.fetch_add(stats.misses, Ordering::Relaxed);
        self.compiles.fetch_add(stats.compiled, Ordering::Relaxed);
        self.failures.fetch_add(stats.failed, Ordering::Relaxed);
    }
}

struct Engine {
    transpiler: Arc<dyn Transpiler>,
    config_store: ConfigStore,
    cache: ResultCache,
    dependencies: DependencyTracker,
    deduplicator: DiagnosticDeduplicator,
    typings: Option<Arc<TypingsMaterializer>>,
    workers: usize,
    counters: Counters,
}

/// Incremental multi-platform compilation cache.
///
/// Owns the result cache, dependency tracker, diagnostic deduplicator and
/// configuration store for its whole lifetime. Cheap to clone; clones share
/// the same engine.
#[derive(Clone)]
pub struct CompilationCache {
    inner: Arc<Engine>,
    cycle: Arc<Mutex<u64>>,
}

impl CompilationCache {
    /// Build an engine from host configuration.
    ///
    /// With `cache.persistent` the durable layer lives in `cache.dir`. If it
    /// cannot be opened the engine logs a warning and runs on the hot layer
    /// alone.
    pub fn new(
        config: &EngineConfig,
        transpiler: Arc<dyn Transpiler>,
    ) -> Result<Self, CompileCacheError> {
        let store: Option<Arc<dyn DurableStore>> = if config.cache.persistent {
            match FilesystemStore::open(config.cache_dir()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(
                        service = services::DURABLE_STORE,
                        status = status::ERROR,
                        "{}, running without a durable layer",
                        CompileCacheError::cache_io("open", &e)
                    );
                    None
                }
            }
        } else {
            None
        };

        Self::build(config, transpiler, store)
    }

    /// Build an engine over a caller-supplied durable store
    pub fn with_store(
        config: &EngineConfig,
        transpiler: Arc<dyn Transpiler>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self, CompileCacheError> {
        Self::build(config, transpiler, Some(store))
    }

    fn build(
        config: &EngineConfig,
        transpiler: Arc<dyn Transpiler>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Result<Self, CompileCacheError> {
        let engine_error = |e: anyhow::Error| CompileCacheError::EngineConfig(format!("{:#}", e));

        config.validate().map_err(engine_error)?;
        let hot = config.hot_eviction().map_err(engine_error)?;
        let cache = match store {
            Some(store) => {
                ResultCache::with_durable(hot, config.durable_eviction().map_err(engine_error)?, store)
            }
            None => ResultCache::in_memory(hot),
        };

        let typings = config
            .typings
            .materialize
            .then(|| Arc::new(TypingsMaterializer::new(config.typings_dir())));

        debug!(
            workers = config.compile.workers,
            durable = cache.has_durable_layer(),
            materialize_typings = typings.is_some(),
            "Compilation cache initialized"
        );

        Ok(Self {
            inner: Arc::new(Engine {
                transpiler,
                config_store: ConfigStore::new(config.compile.extra_options.clone())?,
                cache,
                dependencies: DependencyTracker::new(),
                deduplicator: DiagnosticDeduplicator::new(),
                typings,
                workers: config.compile.workers,
                counters: Counters::default(),
            }),
            cycle: Arc::new(Mutex::new(0)),
        })
    }

    /// Run one build cycle over `units`.
    ///
    /// Fails only with [`CompileCacheError::ConfigInvalid`]; every other
    /// problem is attached to the unit it belongs to.
    pub async fn process_batch(&self, units: &[SourceUnit]) -> Result<BatchReport, CompileCacheError> {
        let mut cycle = self.cycle.lock().await;
        *cycle += 1;
        let number = *cycle;

        let span = info_span!("build_cycle", cycle = number);
        let result = self.run_cycle(number, units).instrument(span).await;

        if let Ok(report) = &result {
            self.inner.counters.record_cycle(&report.stats);
        } else {
            self.inner
                .counters
                .config_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn run_cycle(&self, number: u64, units: &[SourceUnit]) -> Result<BatchReport, CompileCacheError> {
        let config = self.inner.config_store.refresh(units)?;
        self.inner.deduplicator.reset();

        let partitioner =
            PlatformPartitioner::new(&config).map_err(|e| CompileCacheError::ConfigInvalid {
                path: ROOT_CONFIG_PATH.to_string(),
                message: format!("{:#}", e),
            })?;
        let partitions = partitioner.split(units);
        let seen: HashSet<UnitKey> = partitions
            .iter()
            .flat_map(|partition| partition.compile.iter().map(UnitKey::of))
            .collect();

        let mut tasks: Vec<(Vec<UnitReport>, JoinHandle<PartitionResult>)> = Vec::new();
        for partition in partitions {
            let fallback = internal_failures(&partition);
            let engine = Arc::clone(&self.inner);
            let config = Arc::clone(&config);
            tasks.push((
                fallback,
                tokio::spawn(engine.run_partition(config, partition).in_current_span()),
            ));
        }

        let mut report = BatchReport {
            cycle: number,
            config_fingerprint: config.fingerprint(),
            units: Vec::new(),
            stats: CycleStats::default(),
        };

        for (fallback, task) in tasks {
            match task.await {
                Ok(result) => {
                    report.stats.merge(&result.stats);
                    report.units.extend(result.units);
                }
                Err(e) => {
                    error!(
                        service = services::COMPILER,
                        status = status::ERROR,
                        "Partition task failed: {}",
                        e
                    );
                    report.stats.failed += fallback.len() as u64;
                    report.units.extend(fallback);
                }
            }
        }

        self.inner.dependencies.retain(&seen);

        info!(
            service = services::COMPILER,
            hits = report.stats.hits,
            misses = report.stats.misses,
            compiled = report.stats.compiled,
            failed = report.stats.failed,
            suppressed = report.stats.suppressed_warnings,
            "Build cycle complete"
        );

        Ok(report)
    }

    /// Configuration the next cycle starts from
    pub fn current_config(&self) -> Arc<ProjectConfig> {
        self.inner.config_store.current()
    }

    /// Configuration reload notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.inner.config_store.subscribe()
    }

    /// Recorded reference paths for a unit
    pub fn dependencies_of(&self, platform: &str, path: &str) -> Option<Vec<String>> {
        self.inner
            .dependencies
            .dependencies_of(&UnitKey::new(&Platform::new(platform), path))
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        let cache = &self.inner.cache;
        EngineStats {
            cycles: counters.cycles.load(Ordering::Relaxed),
            config_errors: counters.config_errors.load(Ordering::Relaxed),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            compiles: counters.compiles.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            evictions: cache.evictions_total(),
            suppressed_warnings: self.inner.deduplicator.suppressed_total(),
            durable_io_errors: cache.stats().io_errors(),
            hot_entries: cache.len() as u64,
            hot_bytes: cache.hot_bytes(),
        }
    }
}

struct PartitionResult {
    units: Vec<UnitReport>,
    stats: CycleStats,
}

/// Everything a partition task needs to compile one miss
struct PendingCompile {
    unit: SourceUnit,
    key: Fingerprint,
    /// A cached entry existed under `key` but its dependencies changed
    stale: bool,
}

/// Per-partition state shared by every unit of the partition
struct PartitionContext {
    platform: Platform,
    options: Arc<CompilerOptions>,
    options_fingerprint: Fingerprint,
    typings: Arc<Vec<String>>,
    index: Arc<BatchIndex>,
    resolver: ImportResolver,
}

impl Engine {
    async fn run_partition(
        self: Arc<Self>,
        config: Arc<ProjectConfig>,
        partition: Partition,
    ) -> PartitionResult {
        let options = Arc::new(config.options_for(&partition.platform).clone());
        let index = Arc::new(partition.index());
        let ctx = PartitionContext {
            platform: partition.platform.clone(),
            options_fingerprint: options.fingerprint(),
            options,
            typings: Arc::new(config.typings.clone()),
            resolver: ImportResolver::new(Arc::clone(&index)),
            index,
        };

        let mut stats = CycleStats::default();
        let mut units = Vec::with_capacity(partition.unit_count());

        self.materialize_typings(&ctx, &partition.foreign_declarations)
            .await;

        for excluded in &partition.excluded {
            stats.excluded += 1;
            units.push(report(
                &excluded.unit,
                UnitOutcome::Excluded {
                    pattern: excluded.pattern.clone(),
                },
            ));
        }
        for unit in &partition.out_of_scope {
            units.push(report(unit, UnitOutcome::OutOfScope));
        }
        for unit in &partition.declarations {
            stats.declarations += 1;
            units.push(report(
                unit,
                UnitOutcome::Declaration(DeclarationAsset {
                    path: unit.path().to_string(),
                    content_fingerprint: unit.fingerprint(),
                }),
            ));
        }
        for unit in &partition.foreign_declarations {
            units.push(report(unit, UnitOutcome::TrackedOnly));
        }

        let mut pending = Vec::new();
        for unit in partition.compile {
            match self.resolve(&ctx, &unit) {
                Resolution::Hit(entry) => {
                    stats.hits += 1;
                    let outcome = self.replay_hit(&ctx, &unit, &entry, &mut stats);
                    units.push(report(&unit, outcome));
                }
                Resolution::Miss { key, stale } => {
                    stats.misses += 1;
                    pending.push(PendingCompile { unit, key, stale });
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut running = Vec::with_capacity(pending.len());
        for job in pending {
            let request = self.request_for(&ctx, &job.unit);
            let transpiler = Arc::clone(&self.transpiler);
            let contents = job.unit.shared_contents();
            let permit = Arc::clone(&semaphore).acquire_owned().await;
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                transpiler.compile(&contents, &request)
            });
            running.push((job, handle));
        }

        for (job, handle) in running {
            stats.compiled += 1;
            let output = match handle.await {
                Ok(output) => output,
                Err(e) => Err(anyhow::anyhow!("transform task aborted: {}", e)),
            };
            let outcome = self.publish_compiled(&ctx, &job, output, &mut stats);
            if outcome.is_failure() {
                stats.failed += 1;
            }
            units.push(report(&job.unit, outcome));
        }

        let evicted = self.cache.evict_if_needed();
        stats.evicted = evicted.hot_entries + evicted.durable_entries;

        PartitionResult { units, stats }
    }

    async fn materialize_typings(&self, ctx: &PartitionContext, declarations: &[SourceUnit]) {
        let Some(materializer) = &self.typings else {
            return;
        };
        if !ctx.options.include_package_typings || declarations.is_empty() {
            return;
        }

        let materializer = Arc::clone(materializer);
        let declarations = declarations.to_vec();
        let materialized =
            tokio::task::spawn_blocking(move || materializer.materialize(&declarations)).await;
        if let Err(e) = materialized {
            warn!(
                service = services::TYPINGS,
                operation = operations::MATERIALIZE,
                status = status::ERROR,
                "Typings materialization aborted: {}",
                e
            );
        }
    }

    fn resolve(&self, ctx: &PartitionContext, unit: &SourceUnit) -> Resolution {
        let content = unit.fingerprint();
        let key = derive_cache_key(
            unit.path(),
            &ctx.platform,
            &content,
            &ctx.options_fingerprint,
            unit.package_name(),
            unit.options(),
        );

        if !ctx.options.use_cache {
            return Resolution::Miss { key, stale: false };
        }

        let Some(entry) = self.cache.get(&key) else {
            return Resolution::Miss { key, stale: false };
        };

        if entry.fingerprint != content {
            return Resolution::Miss { key, stale: true };
        }

        // References across packages are not tracked
        if unit.is_package_unit() {
            return Resolution::Hit(entry);
        }

        if self
            .dependencies
            .validate_entry(&UnitKey::of(unit), &entry, &ctx.index)
            .is_valid()
        {
            Resolution::Hit(entry)
        } else {
            Resolution::Miss { key, stale: true }
        }
    }

    fn request_for(&self, ctx: &PartitionContext, unit: &SourceUnit) -> CompileRequest {
        CompileRequest {
            compiler_options: Arc::clone(&ctx.options),
            module_name: unit.module_name(),
            file_path: unit.transform_path(),
            source_path: unit.path().to_string(),
            platform: ctx.platform.clone(),
            typings: Arc::clone(&ctx.typings),
            bare: unit.is_bare(),
            resolver: ctx.resolver.clone(),
        }
    }

    fn replay_hit(
        &self,
        ctx: &PartitionContext,
        unit: &SourceUnit,
        entry: &CacheEntry,
        stats: &mut CycleStats,
    ) -> UnitOutcome {
        debug!(
            service = services::COMPILER,
            operation = operations::COMPILE,
            status = status::HIT,
            platform = %ctx.platform,
            path = unit.path(),
            "served from cache"
        );

        let replayed = TransformDiagnostics {
            syntactic: Vec::new(),
            semantic: entry.semantic.clone(),
        };
        let routed = diagnostics::route(&replayed, unit.path(), &ctx.options, unit.is_package_unit());

        UnitOutcome::Compiled(CompiledUnit {
            artifact: entry.artifact.clone(),
            warnings: self.report_warnings(ctx, unit, routed.warnings, stats),
            cache_hit: true,
        })
    }

    fn publish_compiled(
        &self,
        ctx: &PartitionContext,
        job: &PendingCompile,
        output: anyhow::Result<TranspileOutput>,
        stats: &mut CycleStats,
    ) -> UnitOutcome {
        let unit = &job.unit;
        let unit_key = UnitKey::of(unit);

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    service = services::COMPILER,
                    operation = operations::COMPILE,
                    status = status::ERROR,
                    platform = %ctx.platform,
                    path = unit.path(),
                    "Transform failed: {:#}",
                    e
                );
                self.discard(job, &unit_key);
                return UnitOutcome::Failed {
                    errors: vec![transform_failure(unit.path(), &e)],
                    warnings: Vec::new(),
                };
            }
        };

        let routed = diagnostics::route(
            &output.diagnostics,
            unit.path(),
            &ctx.options,
            unit.is_package_unit(),
        );
        let warnings = self.report_warnings(ctx, unit, routed.warnings, stats);

        if !routed.errors.is_empty() {
            debug!(
                service = services::COMPILER,
                operation = operations::COMPILE,
                status = status::ERROR,
                platform = %ctx.platform,
                path = unit.path(),
                errors = routed.errors.len(),
                "unit failed to compile"
            );
            self.discard(job, &unit_key);
            return UnitOutcome::Failed {
                errors: routed.errors,
                warnings,
            };
        }

        let content = unit.fingerprint();
        let artifact = CompiledArtifact {
            source_path: unit.path().to_string(),
            output_path: unit.output_path(),
            code: output.code,
            source_map: output.source_map,
            bare: unit.is_bare(),
            content_fingerprint: content,
        };

        debug!(
            service = services::COMPILER,
            operation = operations::COMPILE,
            status = status::SUCCESS,
            platform = %ctx.platform,
            path = unit.path(),
            "compiled"
        );

        if ctx.options.use_cache {
            let dependencies = if unit.is_package_unit() {
                Vec::new()
            } else {
                let resolved = ctx
                    .resolver
                    .resolve_references(&output.referenced_paths, unit.path());
                ctx.index.snapshot(resolved.iter().map(String::as_str))
            };

            if !unit.is_package_unit() {
                self.dependencies
                    .record(unit_key, content, dependencies.clone());
            }
            let semantic = raw_semantic(&output.diagnostics, unit, &ctx.options);
            self.cache.put(
                job.key,
                CacheEntry::new(artifact.clone(), dependencies, semantic),
            );
        }

        UnitOutcome::Compiled(CompiledUnit {
            artifact,
            warnings,
            cache_hit: false,
        })
    }

    fn discard(&self, job: &PendingCompile, unit_key: &UnitKey) {
        self.dependencies.forget(unit_key);
        if job.stale {
            self.cache.remove(&job.key);
        }
    }

    /// Deduplicate soft warnings and log the ones that are new this cycle
    fn report_warnings(
        &self,
        ctx: &PartitionContext,
        unit: &SourceUnit,
        warnings: Vec<Diagnostic>,
        stats: &mut CycleStats,
    ) -> Vec<Diagnostic> {
        let content = unit.fingerprint();
        warnings
            .into_iter()
            .filter(|warning| {
                let record = DiagnosticRecord::new(warning, &ctx.platform, content);
                if self.deduplicator.should_report(&record) {
                    warn!("{}", warning);
                    true
                } else {
                    stats.suppressed_warnings += 1;
                    debug!(
                        service = services::COMPILER,
                        status = status::SUPPRESSED,
                        platform = %ctx.platform,
                        path = unit.path(),
                        "duplicate warning suppressed"
                    );
                    false
                }
            })
            .collect()
    }
}

enum Resolution {
    Hit(Arc<CacheEntry>),
    Miss { key: Fingerprint, stale: bool },
}

fn report(unit: &SourceUnit, outcome: UnitOutcome) -> UnitReport {
    UnitReport {
        platform: unit.platform().clone(),
        path: unit.path().to_string(),
        package_name: unit.package_name().map(str::to_string),
        outcome,
    }
}

/// Semantic diagnostics worth replaying on later hits
fn raw_semantic(
    diagnostics: &TransformDiagnostics,
    unit: &SourceUnit,
    options: &CompilerOptions,
) -> Vec<RawDiagnostic> {
    if unit.is_package_unit() && !options.pkg_mode {
        return Vec::new();
    }
    diagnostics.semantic.clone()
}

fn transform_failure(path: &str, error: &anyhow::Error) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        kind: DiagnosticKind::Syntactic,
        message: format!("Transform failed: {:#}", error),
        source_path: path.to_string(),
        line: 0,
        column: 0,
    }
}

/// Reports used if a partition task dies before publishing
fn internal_failures(partition: &Partition) -> Vec<UnitReport> {
    partition
        .compile
        .iter()
        .map(|unit| {
            report(
                unit,
                UnitOutcome::Failed {
                    errors: vec![transform_failure(
                        unit.path(),
                        &anyhow::anyhow!("partition for {} aborted", partition.platform),
                    )],
                    warnings: Vec::new(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Upper {
        calls: AtomicUsize,
    }

    impl Transpiler for Upper {
        fn compile(&self, source: &str, request: &CompileRequest) -> anyhow::Result<TranspileOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.contains("panic!") {
                anyhow::bail!("cannot handle {}", request.source_path);
            }
            Ok(TranspileOutput {
                code: source.to_uppercase(),
                ..Default::default()
            })
        }
    }

    fn engine() -> (CompilationCache, Arc<Upper>) {
        let transpiler = Arc::new(Upper {
            calls: AtomicUsize::new(0),
        });
        let cache = CompilationCache::new(
            &EngineConfig::in_memory(),
            Arc::clone(&transpiler) as Arc<dyn Transpiler>,
        )
        .unwrap();
        (cache, transpiler)
    }

    #[tokio::test]
    async fn test_second_cycle_hits() {
        let (cache, transpiler) = engine();
        let batch = vec![SourceUnit::new("a.ts", "let a = 1", "os")];

        let first = cache.process_batch(&batch).await.unwrap();
        let second = cache.process_batch(&batch).await.unwrap();

        assert_eq!(first.stats.compiled, 1);
        assert_eq!(second.stats.hits, 1);
        assert_eq!(second.stats.compiled, 0);
        assert_eq!(transpiler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.cycle, 2);
        assert_eq!(
            second.artifacts().next().map(|a| a.code.as_str()),
            Some("LET A = 1")
        );
    }

    #[tokio::test]
    async fn test_transform_error_fails_only_that_unit() {
        let (cache, _) = engine();
        let batch = vec![
            SourceUnit::new("bad.ts", "panic!()", "os"),
            SourceUnit::new("good.ts", "ok", "os"),
        ];

        let report = cache.process_batch(&batch).await.unwrap();

        assert!(report.outcome("os", "bad.ts").unwrap().is_failure());
        assert!(report.outcome("os", "good.ts").unwrap().artifact().is_some());
        assert_eq!(report.stats.failed, 1);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_engine_config() {
        let mut config = EngineConfig::in_memory();
        config.compile.workers = 0;
        let transpiler: Arc<dyn Transpiler> = Arc::new(Upper {
            calls: AtomicUsize::new(0),
        });

        let result = CompilationCache::new(&config, transpiler);
        assert!(matches!(result, Err(CompileCacheError::EngineConfig(_))));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (cache, _) = engine();
        let report = cache.process_batch(&[]).await.unwrap();

        assert!(report.units.is_empty());
        assert_eq!(cache.stats().cycles, 1);
    }
}
