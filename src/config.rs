use crate::eviction::{EvictionConfig, EvictionPolicyType};
use crate::logging::LogFormat;
use crate::project::CompilerOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration (loaded from TOML, owned by the host)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub compile: CompileConfig,

    #[serde(default)]
    pub typings: TypingsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Durable layer directory
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Keep a durable layer at all; `false` means hot layer only
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Hot layer ceiling (e.g. "10MB")
    #[serde(default = "default_max_size")]
    pub max_size: String,

    /// Durable layer ceiling (e.g. "1GB")
    #[serde(default = "default_durable_max_size")]
    pub durable_max_size: String,

    /// Eviction policy: lru, lfu, fifo
    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: String,

    /// Share of the ceiling to shrink back to
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            persistent: true,
            max_size: default_max_size(),
            durable_max_size: default_durable_max_size(),
            eviction_policy: default_eviction_policy(),
            target_ratio: default_target_ratio(),
        }
    }
}

/// Compilation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Concurrent transform calls per platform partition
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Compiler options forced over every project configuration
    #[serde(default)]
    pub extra_options: Map<String, Value>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            extra_options: Map::new(),
        }
    }
}

/// Package declaration materialisation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingsConfig {
    #[serde(default = "default_true")]
    pub materialize: bool,

    /// Root the declarations are written under
    #[serde(default = "default_typings_dir")]
    pub dir: String,
}

impl Default for TypingsConfig {
    fn default() -> Self {
        Self {
            materialize: true,
            dir: default_typings_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// Default value functions
fn default_cache_dir() -> String {
    ".tscache".to_string()
}

fn default_max_size() -> String {
    "10MB".to_string()
}

fn default_durable_max_size() -> String {
    "1GB".to_string()
}

fn default_eviction_policy() -> String {
    "lru".to_string()
}

fn default_target_ratio() -> f64 {
    0.9
}

fn default_workers() -> usize {
    10
}

fn default_typings_dir() -> String {
    ".".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Hot layer only, nothing written to disk
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.cache.persistent = false;
        config.typings.materialize = false;
        config
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid engine configuration")
    }

    /// File (if any), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TSCACHE_CACHE_DIR`, `TSCACHE_MAX_SIZE`, `TSCACHE_WORKERS` and
    /// `TSCACHE_PERSISTENT`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("TSCACHE_CACHE_DIR") {
            self.cache.dir = dir;
        }
        if let Ok(max_size) = std::env::var("TSCACHE_MAX_SIZE") {
            self.cache.max_size = max_size;
        }
        if let Ok(workers) = std::env::var("TSCACHE_WORKERS") {
            self.compile.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("TSCACHE_WORKERS must be a number: {}", workers))?;
        }
        if let Ok(persistent) = std::env::var("TSCACHE_PERSISTENT") {
            self.cache.persistent = match persistent.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => anyhow::bail!("TSCACHE_PERSISTENT must be a boolean: {}", other),
            };
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.persistent && self.cache.dir.trim().is_empty() {
            anyhow::bail!("cache.dir must be set when cache.persistent is true");
        }

        EvictionConfig::parse_size(&self.cache.max_size).context("cache.max_size is invalid")?;
        EvictionConfig::parse_size(&self.cache.durable_max_size)
            .context("cache.durable_max_size is invalid")?;
        self.cache
            .eviction_policy
            .parse::<EvictionPolicyType>()
            .context("cache.eviction_policy is invalid")?;

        if !(self.cache.target_ratio > 0.0 && self.cache.target_ratio <= 1.0) {
            anyhow::bail!("cache.target_ratio must be in (0, 1]");
        }

        if self.compile.workers == 0 {
            anyhow::bail!("compile.workers must be at least 1");
        }

        CompilerOptions::validate_layer(&self.compile.extra_options)
            .context("compile.extra_options is invalid")?;

        if !["pretty", "compact", "json"].contains(&self.observability.log_format.as_str()) {
            anyhow::bail!("observability.log_format must be one of: pretty, compact, json");
        }

        Ok(())
    }

    /// Eviction settings for the hot layer
    pub fn hot_eviction(&self) -> Result<EvictionConfig> {
        self.eviction_for(&self.cache.max_size)
    }

    /// Eviction settings for the durable layer
    pub fn durable_eviction(&self) -> Result<EvictionConfig> {
        self.eviction_for(&self.cache.durable_max_size)
    }

    fn eviction_for(&self, size: &str) -> Result<EvictionConfig> {
        Ok(EvictionConfig {
            max_size_bytes: EvictionConfig::parse_size(size)?,
            policy: self.cache.eviction_policy.parse()?,
            target_ratio: self.cache.target_ratio,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache.dir)
    }

    pub fn typings_dir(&self) -> PathBuf {
        PathBuf::from(&self.typings.dir)
    }

    /// Install the global subscriber from the observability section
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::try_init_with_level(
            LogFormat::parse(&self.observability.log_format),
            &self.observability.log_level,
        )
    }

    /// Example configuration as TOML
    pub fn example() -> Result<String> {
        toml::to_string_pretty(&Self::default()).context("Failed to render example configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            "TSCACHE_CACHE_DIR",
            "TSCACHE_MAX_SIZE",
            "TSCACHE_WORKERS",
            "TSCACHE_PERSISTENT",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.dir, ".tscache");
        assert_eq!(config.cache.max_size, "10MB");
        assert_eq!(config.cache.eviction_policy, "lru");
        assert_eq!(config.compile.workers, 10);
        assert!(config.validate().is_ok());
        assert_eq!(config.hot_eviction().unwrap().max_size_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_parse_toml() {
        let config = EngineConfig::from_toml(
            r#"
            [cache]
            dir = "/tmp/tscache"
            max_size = "2MB"
            eviction_policy = "fifo"

            [compile]
            workers = 4
            extra_options = { module = "commonjs", experimentalDecorators = true }
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.dir, "/tmp/tscache");
        assert!(config.cache.persistent);
        assert_eq!(config.compile.workers, 4);
        assert_eq!(
            config.compile.extra_options.get("module"),
            Some(&Value::String("commonjs".to_string()))
        );
        assert_eq!(config.hot_eviction().unwrap().policy, EvictionPolicyType::Fifo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.cache.eviction_policy = "ttl".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.compile.workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.target_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config
            .compile
            .extra_options
            .insert("module".to_string(), Value::String("cobol".to_string()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tscache.toml");
        fs::write(&path, "[typings]\nmaterialize = false\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.typings.materialize);
        assert_eq!(config.typings.dir, ".");

        assert!(EngineConfig::from_file(temp_dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let example = EngineConfig::example().unwrap();
        let parsed = EngineConfig::from_toml(&example).unwrap();
        assert_eq!(parsed.cache.max_size, "10MB");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("TSCACHE_CACHE_DIR", "/var/cache/tscache");
        std::env::set_var("TSCACHE_MAX_SIZE", "64MB");
        std::env::set_var("TSCACHE_WORKERS", "3");
        std::env::set_var("TSCACHE_PERSISTENT", "false");

        let config = EngineConfig::load(None).unwrap();
        clear_env();

        assert_eq!(config.cache.dir, "/var/cache/tscache");
        assert_eq!(config.cache.max_size, "64MB");
        assert_eq!(config.compile.workers, 3);
        assert!(!config.cache.persistent);
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        clear_env();
        std::env::set_var("TSCACHE_WORKERS", "many");

        let result = EngineConfig::load(None);
        clear_env();

        assert!(result.is_err());
    }
}
