//! Compiler options as understood by the cache
//!
//! Options are layered as raw JSON objects (defaults, project config, engine
//! extra options, platform override) and only then deserialized, so every
//! layer is validated against the same vocabulary.

use crate::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Module system the transform emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModuleKind {
    CommonJs,
    Amd,
    Umd,
    System,
    Es6,
    Es2015,
    None,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommonJs => "commonjs",
            Self::Amd => "amd",
            Self::Umd => "umd",
            Self::System => "system",
            Self::Es6 => "es6",
            Self::Es2015 => "es2015",
            Self::None => "none",
        }
    }
}

impl FromStr for ModuleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "commonjs" => Ok(Self::CommonJs),
            "amd" => Ok(Self::Amd),
            "umd" => Ok(Self::Umd),
            "system" => Ok(Self::System),
            "es6" => Ok(Self::Es6),
            "es2015" => Ok(Self::Es2015),
            "none" => Ok(Self::None),
            _ => anyhow::bail!(
                "unknown module option: {}. Must be commonjs, amd, umd, system, es6, es2015 or none",
                s
            ),
        }
    }
}

impl TryFrom<String> for ModuleKind {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ModuleKind> for String {
    fn from(kind: ModuleKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language level the transform emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScriptTarget {
    Es3,
    Es5,
    Es6,
    Es2015,
    Es2016,
    Es2017,
    EsNext,
}

impl ScriptTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es3 => "es3",
            Self::Es5 => "es5",
            Self::Es6 => "es6",
            Self::Es2015 => "es2015",
            Self::Es2016 => "es2016",
            Self::Es2017 => "es2017",
            Self::EsNext => "esnext",
        }
    }
}

impl FromStr for ScriptTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "es3" => Ok(Self::Es3),
            "es5" => Ok(Self::Es5),
            "es6" => Ok(Self::Es6),
            "es2015" => Ok(Self::Es2015),
            "es2016" => Ok(Self::Es2016),
            "es2017" => Ok(Self::Es2017),
            "esnext" => Ok(Self::EsNext),
            _ => anyhow::bail!("unknown target option: {}", s),
        }
    }
}

impl TryFrom<String> for ScriptTarget {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScriptTarget> for String {
    fn from(target: ScriptTarget) -> Self {
        target.as_str().to_string()
    }
}

impl fmt::Display for ScriptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective option set for one platform partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOptions {
    pub module: ModuleKind,
    pub target: ScriptTarget,
    pub source_map: bool,
    /// Log semantic diagnostics as warnings
    pub diagnostics: bool,
    /// Turn semantic diagnostics into hard errors
    pub always_throw: bool,
    /// Report semantic diagnostics for package units too
    pub pkg_mode: bool,
    pub emit_decorator_metadata: bool,
    pub include_package_typings: bool,
    pub use_cache: bool,
    /// Options the cache does not interpret, passed through to the transform
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            module: ModuleKind::System,
            target: ScriptTarget::Es5,
            source_map: true,
            diagnostics: true,
            always_throw: false,
            pkg_mode: false,
            emit_decorator_metadata: true,
            include_package_typings: true,
            use_cache: true,
            other: BTreeMap::new(),
        }
    }
}

impl CompilerOptions {
    /// Build options from layers, later layers overriding earlier ones key by key
    pub fn from_layers<'a, I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Map<String, Value>>,
    {
        let mut merged = Self::default_layer();
        for layer in layers {
            for (key, value) in layer {
                merged.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(Value::Object(merged)).context("invalid compilerOptions")
    }

    /// Check a single layer against the option vocabulary
    pub fn validate_layer(layer: &Map<String, Value>) -> Result<()> {
        Self::from_layers([layer]).map(|_| ())
    }

    fn default_layer() -> Map<String, Value> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Identity of the option set, part of every cache key
    pub fn fingerprint(&self) -> Fingerprint {
        // Field order is fixed and `other` is sorted, so the JSON is canonical
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        Fingerprint::of(canonical)
    }
}
