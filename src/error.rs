use thiserror::Error;

/// Errors surfaced by the compilation cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileCacheError {
    /// Malformed or unvalidatable project configuration. Aborts the cycle.
    #[error("Invalid configuration in {path}: {message}")]
    ConfigInvalid { path: String, message: String },

    /// Syntax error in one unit. Always a hard error for that unit.
    #[error("{path} ({line}, {column}): {message}")]
    CompileSyntax {
        path: String,
        message: String,
        line: u32,
        column: u32,
    },

    /// Semantic diagnostic in one unit
    #[error("{path} ({line}, {column}): {message}")]
    CompileSemantic {
        path: String,
        message: String,
        line: u32,
        column: u32,
    },

    /// Durable cache read or write failure, degraded to a miss
    #[error("Cache I/O error during {operation}: {message}")]
    CacheIo { operation: String, message: String },

    /// Invalid engine configuration at construction time
    #[error("Engine configuration error: {0}")]
    EngineConfig(String),
}

impl CompileCacheError {
    pub(crate) fn cache_io(operation: &str, error: &anyhow::Error) -> Self {
        Self::CacheIo {
            operation: operation.to_string(),
            message: format!("{:#}", error),
        }
    }

    /// Whether the error aborts a whole build cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInvalid { .. } | Self::EngineConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display_matches_console_format() {
        let err = CompileCacheError::CompileSyntax {
            path: "foo.ts".to_string(),
            message: "';' expected.".to_string(),
            line: 3,
            column: 14,
        };
        assert_eq!(err.to_string(), "foo.ts (3, 14): ';' expected.");
    }

    #[test]
    fn test_fatality() {
        assert!(CompileCacheError::ConfigInvalid {
            path: "tsconfig.json".to_string(),
            message: "bad".to_string()
        }
        .is_fatal());
        assert!(!CompileCacheError::cache_io("get", &anyhow::anyhow!("disk gone")).is_fatal());
    }
}
