// Common test utilities shared across acceptance tests
//
// Every test builds its own engine over its own transform, so tests can run in
// parallel. Engines that need a durable layer get a temp directory that is
// removed when the returned guard is dropped.
//
// The scripted transform understands a tiny subset of the source language:
// - `export const NAME = VALUE` lines become `exports.NAME = VALUE;`
// - `import {x} from "specifier"` lines are reported as references
// - a line containing `@@syntax` yields a syntactic diagnostic
// - a line containing `@@warn MESSAGE` yields a semantic diagnostic

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tscache::{
    CompilationCache, CompileRequest, EngineConfig, ModuleKind, RawDiagnostic, SourceUnit,
    TransformDiagnostics, TranspileOutput, Transpiler,
};

/// Transform double that counts calls per (platform, path)
#[derive(Default)]
pub struct MockTranspiler {
    calls: AtomicUsize,
    per_unit: Mutex<HashMap<(String, String), usize>>,
    /// Contents seen through `resolve_import`, by specifier
    resolved: Mutex<HashMap<String, Option<String>>>,
}

impl MockTranspiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn calls_for(&self, platform: &str, path: &str) -> usize {
        self.per_unit
            .lock()
            .unwrap()
            .get(&(platform.to_string(), path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn resolved(&self, specifier: &str) -> Option<Option<String>> {
        self.resolved.lock().unwrap().get(specifier).cloned()
    }
}

impl Transpiler for MockTranspiler {
    fn compile(&self, source: &str, request: &CompileRequest) -> anyhow::Result<TranspileOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_unit
            .lock()
            .unwrap()
            .entry((
                request.platform.as_str().to_string(),
                request.source_path.clone(),
            ))
            .or_insert(0) += 1;

        let mut body = Vec::new();
        let mut diagnostics = TransformDiagnostics::default();
        let mut referenced_paths = Vec::new();

        for (number, line) in source.lines().enumerate() {
            let line_number = number as u32 + 1;
            let trimmed = line.trim();

            if trimmed.contains("@@syntax") {
                diagnostics
                    .syntactic
                    .push(RawDiagnostic::new("';' expected.", line_number, 1));
            }
            if let Some((_, message)) = trimmed.split_once("@@warn ") {
                diagnostics
                    .semantic
                    .push(RawDiagnostic::new(message.trim(), line_number, 1));
            }

            if trimmed.starts_with("import ") {
                if let Some(specifier) = quoted(trimmed) {
                    let contents = request.resolve_import(&specifier).map(|c| c.to_string());
                    self.resolved
                        .lock()
                        .unwrap()
                        .insert(specifier.clone(), contents);
                    referenced_paths.push(specifier);
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("export const ") {
                let (name, value) = rest.split_once('=').unwrap_or((rest, "undefined"));
                body.push(format!(
                    "exports.{} = {};",
                    name.trim(),
                    value.trim().trim_end_matches(';')
                ));
            } else if !trimmed.is_empty() && !trimmed.starts_with("//") {
                body.push(trimmed.to_string());
            }
        }

        let code = match request.compiler_options.module {
            ModuleKind::System if !request.bare => format!(
                "System.register(\"{}\", [], function (exports_1) {{\n{}\n}});",
                request.module_name,
                body.join("\n")
            ),
            _ => format!("\"use strict\";\n{}", body.join("\n")),
        };

        let source_map = request
            .compiler_options
            .source_map
            .then(|| format!("{{\"file\":\"{}\"}}", request.file_path));

        Ok(TranspileOutput {
            code,
            source_map,
            diagnostics,
            referenced_paths,
        })
    }
}

fn quoted(line: &str) -> Option<String> {
    let start = line.find(|c| c == '"' || c == '\'')?;
    let quote = line[start..].chars().next()?;
    let rest = &line[start + 1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string())
}

/// Engine with a hot layer only
pub fn memory_engine(transpiler: &Arc<MockTranspiler>) -> CompilationCache {
    CompilationCache::new(
        &EngineConfig::in_memory(),
        Arc::clone(transpiler) as Arc<dyn Transpiler>,
    )
    .unwrap()
}

/// Engine with a durable layer in a fresh temp directory
#[allow(dead_code)]
pub fn persistent_engine(transpiler: &Arc<MockTranspiler>) -> (CompilationCache, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let engine = persistent_engine_at(transpiler, &temp_dir);
    (engine, temp_dir)
}

/// Engine with a durable layer in an existing directory
#[allow(dead_code)]
pub fn persistent_engine_at(transpiler: &Arc<MockTranspiler>, dir: &TempDir) -> CompilationCache {
    let mut config = EngineConfig::in_memory();
    config.cache.persistent = true;
    config.cache.dir = dir.path().join("cache").to_string_lossy().into_owned();
    CompilationCache::new(&config, Arc::clone(transpiler) as Arc<dyn Transpiler>).unwrap()
}

pub fn unit(path: &str, contents: &str, platform: &str) -> SourceUnit {
    SourceUnit::new(path, contents, platform)
}

#[allow(dead_code)]
pub fn config_unit(contents: &str, platform: &str) -> SourceUnit {
    SourceUnit::new("tsconfig.json", contents, platform)
}
