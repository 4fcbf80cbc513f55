//! Diagnostic routing and cross-platform deduplication
//!
//! The transform reports syntactic and semantic diagnostics per unit. Routing
//! decides which of them are hard errors (the unit fails) and which are soft
//! warnings (logged, artifact still published). Soft warnings then go through
//! the [`DiagnosticDeduplicator`] so a unit compiled once per platform only
//! warns once per cycle.

use crate::error::CompileCacheError;
use crate::fingerprint::Fingerprint;
use crate::project::CompilerOptions;
use crate::unit::Platform;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Diagnostic as reported by the transform, relative to the unit it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl RawDiagnostic {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Diagnostics the transform produced for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformDiagnostics {
    pub syntactic: Vec<RawDiagnostic>,
    pub semantic: Vec<RawDiagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks publishing the unit's artifact
    Error,
    /// Informational
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Syntactic,
    Semantic,
}

/// Diagnostic attached to a unit's outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub source_path: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    fn from_raw(raw: &RawDiagnostic, path: &str, severity: Severity, kind: DiagnosticKind) -> Self {
        Self {
            severity,
            kind,
            message: raw.message.clone(),
            source_path: path.to_string(),
            line: raw.line,
            column: raw.column,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render as the error taxonomy
    pub fn to_error(&self) -> CompileCacheError {
        let (path, message) = (self.source_path.clone(), self.message.clone());
        match self.kind {
            DiagnosticKind::Syntactic => CompileCacheError::CompileSyntax {
                path,
                message,
                line: self.line,
                column: self.column,
            },
            DiagnosticKind::Semantic => CompileCacheError::CompileSemantic {
                path,
                message,
                line: self.line,
                column: self.column,
            },
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}): {}",
            self.source_path, self.line, self.column, self.message
        )
    }
}

/// Diagnostics split into hard errors and soft warnings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutedDiagnostics {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl RoutedDiagnostics {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Route a unit's diagnostics according to its compiler options.
///
/// - syntactic diagnostics are always errors
/// - package units drop semantic diagnostics unless `pkgMode` is set
/// - `alwaysThrow` turns semantic diagnostics into errors
/// - otherwise semantic diagnostics are warnings when `diagnostics` is set,
///   and dropped when it is not
pub fn route(
    diagnostics: &TransformDiagnostics,
    path: &str,
    options: &CompilerOptions,
    is_package_unit: bool,
) -> RoutedDiagnostics {
    let mut routed = RoutedDiagnostics {
        errors: diagnostics
            .syntactic
            .iter()
            .map(|d| Diagnostic::from_raw(d, path, Severity::Error, DiagnosticKind::Syntactic))
            .collect(),
        warnings: Vec::new(),
    };

    if is_package_unit && !options.pkg_mode {
        return routed;
    }

    if options.always_throw {
        routed.errors.extend(
            diagnostics
                .semantic
                .iter()
                .map(|d| Diagnostic::from_raw(d, path, Severity::Error, DiagnosticKind::Semantic)),
        );
    } else if options.diagnostics {
        routed.warnings.extend(
            diagnostics
                .semantic
                .iter()
                .map(|d| Diagnostic::from_raw(d, path, Severity::Warning, DiagnosticKind::Semantic)),
        );
    }

    routed
}

/// Normalised identity of one reported diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub message: String,
    pub source_path: String,
    pub line: u32,
    pub column: u32,
    pub platform: Platform,
    /// Content fingerprint of the unit that produced it
    pub content: Fingerprint,
}

impl DiagnosticRecord {
    pub fn new(diagnostic: &Diagnostic, platform: &Platform, content: Fingerprint) -> Self {
        Self {
            severity: diagnostic.severity,
            message: diagnostic.message.clone(),
            source_path: diagnostic.source_path.clone(),
            line: diagnostic.line,
            column: diagnostic.column,
            platform: platform.clone(),
            content,
        }
    }

    /// Platform is left out: the same logical unit on another platform is the
    /// same diagnostic
    fn dedup_key(&self) -> Fingerprint {
        let (line, column) = (self.line.to_le_bytes(), self.column.to_le_bytes());
        Fingerprint::of_parts([
            self.message.as_bytes(),
            self.source_path.as_bytes(),
            line.as_slice(),
            column.as_slice(),
            self.content.as_bytes(),
        ])
    }
}

/// Suppresses repeats of a soft diagnostic within one build cycle.
///
/// Owned by one engine instance; the seen-set is cleared at the start of each
/// cycle.
#[derive(Debug, Default)]
pub struct DiagnosticDeduplicator {
    seen: Mutex<HashSet<Fingerprint>>,
    suppressed: AtomicU64,
}

impl DiagnosticDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `record` should be reported. Errors are always reported and
    /// never remembered.
    pub fn should_report(&self, record: &DiagnosticRecord) -> bool {
        if record.severity == Severity::Error {
            return true;
        }

        let first = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.dedup_key());
        if !first {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
        first
    }

    /// Forget everything reported so far
    pub fn reset(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Repeats suppressed over the deduplicator's lifetime
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
