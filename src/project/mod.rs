//! Project configuration (`tsconfig.json` units)
//!
//! A [`ProjectConfig`] is the normalised form of at most one root
//! configuration and one server-platform override. [`ConfigStore`] owns the
//! active instance and only reparses when a configuration unit's fingerprint
//! changes.

mod options;
mod store;

pub use options::{CompilerOptions, ModuleKind, ScriptTarget};
pub use store::{ConfigStore, ReloadEvent};

use crate::fingerprint::Fingerprint;
use crate::unit::{is_declaration_path, Platform, PlatformKind};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Bumped whenever the normalised layout below changes
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Raw shape of a configuration unit
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub compiler_options: Map<String, Value>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

impl ConfigDocument {
    /// Parse and validate the JSON contents of a configuration unit
    pub fn parse(contents: &str) -> Result<Self> {
        let document: ConfigDocument =
            serde_json::from_str(contents).context("Format of the tsconfig is invalid")?;
        CompilerOptions::validate_layer(&document.compiler_options)?;
        if let Some(patterns) = &document.exclude {
            for pattern in patterns {
                glob::Pattern::new(pattern)
                    .with_context(|| format!("Invalid exclude pattern: {}", pattern))?;
            }
        }
        Ok(document)
    }

    /// Entries of `files` that are declaration paths; everything else is ignored
    pub fn typings(&self) -> Vec<String> {
        self.files
            .iter()
            .flatten()
            .filter(|path| is_declaration_path(path))
            .cloned()
            .collect()
    }
}

/// Effective project configuration for one build cycle
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    fingerprint: Fingerprint,
    root_options: Map<String, Value>,
    extra_options: Map<String, Value>,
    server_overrides: Option<Map<String, Value>>,
    base: CompilerOptions,
    server: Option<CompilerOptions>,
    /// Declaration-only paths registered through `files`
    pub typings: Vec<String>,
    /// User exclusion patterns, in declaration order
    pub exclude: Vec<String>,
}

impl ProjectConfig {
    /// Normalise a root document, an optional server override and the engine's
    /// extra options into one configuration
    pub fn build(
        root: Option<(&Fingerprint, &ConfigDocument)>,
        server: Option<(&Fingerprint, &ConfigDocument)>,
        extra_options: &Map<String, Value>,
    ) -> Result<Self> {
        let root_options = root
            .map(|(_, doc)| doc.compiler_options.clone())
            .unwrap_or_default();
        let server_overrides = server.map(|(_, doc)| doc.compiler_options.clone());

        let base = CompilerOptions::from_layers([&root_options, extra_options])?;
        let server_options = match &server_overrides {
            Some(overrides) => Some(
                CompilerOptions::from_layers([&root_options, extra_options, overrides])
                    .context("invalid server compilerOptions")?,
            ),
            None => None,
        };

        let no_fingerprint = String::from("-");
        let fingerprint = Fingerprint::of_parts([
            format!("v{}", CONFIG_FORMAT_VERSION),
            root.map(|(fp, _)| fp.to_hex()).unwrap_or_else(|| no_fingerprint.clone()),
            server.map(|(fp, _)| fp.to_hex()).unwrap_or(no_fingerprint),
            serde_json::to_string(extra_options).unwrap_or_default(),
        ]);

        Ok(Self {
            fingerprint,
            root_options,
            extra_options: extra_options.clone(),
            server_overrides,
            base,
            server: server_options,
            typings: root.map(|(_, doc)| doc.typings()).unwrap_or_default(),
            exclude: root
                .and_then(|(_, doc)| doc.exclude.clone())
                .unwrap_or_default(),
        })
    }

    /// Configuration used before any configuration unit has been seen
    pub fn with_extra_options(extra_options: &Map<String, Value>) -> Result<Self> {
        Self::build(None, None, extra_options)
    }

    /// Versioned fingerprint of the serialized configuration
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Effective options for a platform. The server override never applies to
    /// web platforms.
    pub fn options_for(&self, platform: &Platform) -> &CompilerOptions {
        match (platform.kind(), &self.server) {
            (PlatformKind::Server, Some(server)) => server,
            _ => &self.base,
        }
    }

    pub fn base_options(&self) -> &CompilerOptions {
        &self.base
    }

    pub fn has_server_overrides(&self) -> bool {
        self.server_overrides.is_some()
    }

    /// Raw root `compilerOptions`, before defaults and extra options
    pub fn root_options(&self) -> &Map<String, Value> {
        &self.root_options
    }

    pub fn extra_options(&self) -> &Map<String, Value> {
        &self.extra_options
    }
}
