use crate::diagnostics::RawDiagnostic;
use crate::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Compiled output for one unit, as published to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub source_path: String,
    pub output_path: String,
    pub code: String,
    pub source_map: Option<String>,
    /// Emitted without a module wrapper
    pub bare: bool,
    pub content_fingerprint: Fingerprint,
}

/// A dependency path and its content fingerprint when the entry was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFingerprint {
    pub path: String,
    pub fingerprint: Fingerprint,
}

/// Value stored in the result cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub artifact: CompiledArtifact,
    /// Byte cost for eviction accounting
    pub size_bytes: u64,
    /// Content fingerprint the artifact was computed from
    pub fingerprint: Fingerprint,
    /// Direct references discovered during compilation, in discovery order
    pub dependencies: Vec<DependencyFingerprint>,
    /// Semantic diagnostics, replayed on every hit
    #[serde(default)]
    pub semantic: Vec<RawDiagnostic>,
}

impl CacheEntry {
    pub fn new(
        artifact: CompiledArtifact,
        dependencies: Vec<DependencyFingerprint>,
        semantic: Vec<RawDiagnostic>,
    ) -> Self {
        let size_bytes = (artifact.code.len()
            + artifact.source_map.as_ref().map(String::len).unwrap_or(0))
            as u64;
        Self {
            fingerprint: artifact.content_fingerprint,
            artifact,
            size_bytes,
            dependencies,
            semantic,
        }
    }

    pub fn dependency_paths(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.path.as_str())
    }

    /// Encode for the durable layer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize cache entry")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to deserialize cache entry")
    }
}
