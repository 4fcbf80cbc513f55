// Library interface for tscache
// Hosts drive the engine through CompilationCache; the component modules are
// public so integration tests and embedders can use them directly.

pub mod cache;
pub mod compiler;
pub mod config;
pub mod dependencies;
pub mod diagnostics;
pub mod error;
pub mod eviction;
pub mod fingerprint;
pub mod logging;
pub mod partition;
pub mod project;
pub mod storage;
pub mod transform;
pub mod typings;
pub mod unit;

// Re-export commonly used types
pub use cache::{CacheEntry, CompiledArtifact, ResultCache};
pub use compiler::{
    BatchReport, CompilationCache, CompiledUnit, CycleStats, DeclarationAsset, EngineStats,
    UnitOutcome, UnitReport,
};
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind, RawDiagnostic, Severity, TransformDiagnostics};
pub use error::CompileCacheError;
pub use fingerprint::Fingerprint;
pub use project::{CompilerOptions, ModuleKind, ProjectConfig, ReloadEvent, ScriptTarget};
pub use storage::{DurableStore, FilesystemStore, MemoryStore};
pub use transform::{CompileRequest, ImportResolver, TranspileOutput, Transpiler};
pub use unit::{Platform, PlatformKind, SourceInput, SourceUnit, UnitOptions};
