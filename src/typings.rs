//! Materialisation of package declaration files
//!
//! Declarations owned by packages are never compiled, but editors and the
//! transform's own tooling expect them on disk. Each one is written under the
//! configured root the first time this engine sees it, unless a file already
//! exists there. Failures are logged and never fail a cycle.

use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::unit::{SourceInput, SourceUnit};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Outcome of one materialisation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub written: Vec<PathBuf>,
    /// Already on disk or already handled by this engine
    pub skipped: usize,
    pub failed: usize,
}

/// Writes package declarations to disk, once per engine instance
#[derive(Debug)]
pub struct TypingsMaterializer {
    root: PathBuf,
    seen: Mutex<HashSet<(String, Fingerprint)>>,
}

impl TypingsMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn materialize<'a, I>(&self, units: I) -> MaterializeReport
    where
        I: IntoIterator<Item = &'a SourceUnit>,
    {
        let mut report = MaterializeReport::default();

        for unit in units {
            let first_time = self
                .seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((unit.path().to_string(), unit.fingerprint()));
            if !first_time {
                report.skipped += 1;
                continue;
            }

            match self.write_if_missing(unit) {
                Ok(Some(path)) => {
                    info!(
                        service = services::TYPINGS,
                        operation = operations::MATERIALIZE,
                        status = status::SUCCESS,
                        path = %path.display(),
                        "typings file created"
                    );
                    report.written.push(path);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        service = services::TYPINGS,
                        operation = operations::MATERIALIZE,
                        status = status::ERROR,
                        path = unit.path(),
                        "Failed to materialize typings: {:#}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn write_if_missing(&self, unit: &SourceUnit) -> Result<Option<PathBuf>> {
        let relative = Path::new(unit.path());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("refusing to write outside the typings root: {}", unit.path());
        }

        let target = self.root.join(relative);
        if target.exists() {
            return Ok(None);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&target, unit.contents())
            .with_context(|| format!("Failed to write {}", target.display()))?;

        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn declaration(path: &str, contents: &str) -> SourceUnit {
        SourceUnit::new(path, contents, "os").with_package("meteor:tracker")
    }

    #[test]
    fn test_writes_missing_declarations() {
        let temp_dir = TempDir::new().unwrap();
        let materializer = TypingsMaterializer::new(temp_dir.path());
        let units = vec![declaration("typings/tracker.d.ts", "declare module Tracker {}")];

        let report = materializer.materialize(&units);

        assert_eq!(report.written.len(), 1);
        let written = fs::read_to_string(temp_dir.path().join("typings/tracker.d.ts")).unwrap();
        assert_eq!(written, "declare module Tracker {}");
    }

    #[test]
    fn test_existing_files_are_left_alone() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("tracker.d.ts"), "// edited by hand").unwrap();
        let materializer = TypingsMaterializer::new(temp_dir.path());

        let report = materializer.materialize(&[declaration("tracker.d.ts", "declare const x: 1;")]);

        assert!(report.written.is_empty());
        assert_eq!(report.skipped, 1);
        let contents = fs::read_to_string(temp_dir.path().join("tracker.d.ts")).unwrap();
        assert_eq!(contents, "// edited by hand");
    }

    #[test]
    fn test_each_declaration_is_handled_once() {
        let temp_dir = TempDir::new().unwrap();
        let materializer = TypingsMaterializer::new(temp_dir.path());
        let units = vec![declaration("a.d.ts", "declare const a: 1;")];

        materializer.materialize(&units);
        fs::remove_file(temp_dir.path().join("a.d.ts")).unwrap();
        let report = materializer.materialize(&units);

        assert!(report.written.is_empty());
        assert!(!temp_dir.path().join("a.d.ts").exists());
    }

    #[test]
    fn test_paths_cannot_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let materializer = TypingsMaterializer::new(temp_dir.path().join("root"));

        let report = materializer.materialize(&[declaration("../evil.d.ts", "")]);

        assert_eq!(report.failed, 1);
        assert!(!temp_dir.path().join("evil.d.ts").exists());
    }
}
