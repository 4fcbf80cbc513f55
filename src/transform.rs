//! Seam to the wrapped source-to-output transform
//!
//! The engine never parses or type-checks anything itself. It hands each
//! cache miss to a [`Transpiler`] together with a [`CompileRequest`] that
//! carries the effective options and an [`ImportResolver`] backed by the
//! current batch, so the transform can follow cross-unit references without
//! touching the filesystem.

use crate::dependencies::BatchIndex;
use crate::diagnostics::TransformDiagnostics;
use crate::project::CompilerOptions;
use crate::unit::Platform;
use anyhow::Result;
use std::sync::Arc;

/// Suffixes tried, in order, when an import names a path without extension
const RESOLVE_SUFFIXES: &[&str] = &[".ts", ".tsx", ".d.ts", "/index.ts", "/index.tsx"];

/// Expensive source-to-output transform
pub trait Transpiler: Send + Sync {
    /// Compile one unit. The call must not mutate anything shared with other
    /// units compiling at the same time.
    fn compile(&self, source: &str, request: &CompileRequest) -> Result<TranspileOutput>;
}

impl<F> Transpiler for F
where
    F: Fn(&str, &CompileRequest) -> Result<TranspileOutput> + Send + Sync,
{
    fn compile(&self, source: &str, request: &CompileRequest) -> Result<TranspileOutput> {
        self(source, request)
    }
}

/// Everything the transform needs besides the source text
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub compiler_options: Arc<CompilerOptions>,
    /// Module name the output registers under
    pub module_name: String,
    /// Absolute-looking path, `/` + package-prefixed path
    pub file_path: String,
    /// Path as supplied by the host
    pub source_path: String,
    pub platform: Platform,
    /// Declaration paths registered in the project configuration
    pub typings: Arc<Vec<String>>,
    /// Emit without a module wrapper
    pub bare: bool,
    pub resolver: ImportResolver,
}

impl CompileRequest {
    /// Contents of the unit `specifier` refers to, relative to this unit
    pub fn resolve_import(&self, specifier: &str) -> Option<Arc<str>> {
        self.resolver.resolve_import(specifier, &self.source_path)
    }
}

/// What the transform produced for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranspileOutput {
    pub code: String,
    pub source_map: Option<String>,
    pub diagnostics: TransformDiagnostics,
    /// Direct references, as resolved paths or import specifiers
    pub referenced_paths: Vec<String>,
}

/// Resolves import specifiers against the units of the current batch
#[derive(Debug, Clone)]
pub struct ImportResolver {
    index: Arc<BatchIndex>,
}

impl ImportResolver {
    pub fn new(index: Arc<BatchIndex>) -> Self {
        Self { index }
    }

    /// Batch path that `specifier`, imported from `from`, refers to.
    ///
    /// `./` and `../` specifiers are relative to the importing unit, a leading
    /// `/` and bare specifiers are relative to the project root. Specifiers
    /// without an extension try `.ts`, `.tsx`, `.d.ts` and `index` files.
    pub fn resolve_path(&self, specifier: &str, from: &str) -> Option<String> {
        let base = if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = from.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            normalize(&format!("{}/{}", dir, specifier))?
        } else {
            normalize(specifier.trim_start_matches('/'))?
        };

        if self.index.contains(&base) {
            return Some(base);
        }

        RESOLVE_SUFFIXES
            .iter()
            .map(|suffix| format!("{}{}", base, suffix))
            .find(|candidate| self.index.contains(candidate))
    }

    /// Contents behind `specifier`, or `None` if it is not in the batch
    pub fn resolve_import(&self, specifier: &str, from: &str) -> Option<Arc<str>> {
        let path = self.resolve_path(specifier, from)?;
        self.index.contents(&path)
    }

    /// Resolve the transform's reported references into batch paths,
    /// dropping self-references and anything outside the batch
    pub fn resolve_references(&self, references: &[String], from: &str) -> Vec<String> {
        references
            .iter()
            .filter_map(|reference| self.resolve_path(reference, from))
            .filter(|path| path != from)
            .collect()
    }

    pub fn index(&self) -> &BatchIndex {
        &self.index
    }
}

/// Collapse `.` and `..` segments; `None` if the path climbs above the root
fn normalize(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            segment => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}
