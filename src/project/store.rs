//! Active project configuration with fingerprint-driven reload
//!
//! The store keeps one fingerprint per configuration role (root and server
//! override). A configuration unit is only reparsed when its fingerprint
//! differs from the stored one; otherwise the previous [`ProjectConfig`]
//! instance is handed out again. Parse failures abort the cycle and leave the
//! stored state untouched.

use super::{ConfigDocument, ProjectConfig};
use crate::error::CompileCacheError;
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::unit::{SourceInput, SourceUnit};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration reload event
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// A configuration unit changed and was applied
    Reloaded(Arc<ProjectConfig>),
    /// A configuration unit changed but could not be applied
    Failed(String),
}

#[derive(Debug, Clone)]
struct StoredDocument {
    fingerprint: Fingerprint,
    document: ConfigDocument,
}

struct StoreState {
    root: Option<StoredDocument>,
    server: Option<StoredDocument>,
    current: Arc<ProjectConfig>,
}

/// Holds the active [`ProjectConfig`] across build cycles
pub struct ConfigStore {
    state: Mutex<StoreState>,
    extra_options: Map<String, Value>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl ConfigStore {
    /// Create a store whose initial configuration is the defaults plus
    /// `extra_options`
    pub fn new(extra_options: Map<String, Value>) -> Result<Self, CompileCacheError> {
        let initial = ProjectConfig::with_extra_options(&extra_options)
            .map_err(|e| CompileCacheError::EngineConfig(format!("{:#}", e)))?;
        let (reload_tx, _) = broadcast::channel(16);

        Ok(Self {
            state: Mutex::new(StoreState {
                root: None,
                server: None,
                current: Arc::new(initial),
            }),
            extra_options,
            reload_tx,
        })
    }

    /// Currently effective configuration
    pub fn current(&self) -> Arc<ProjectConfig> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.current)
    }

    /// Subscribe to reload events
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    /// Scan a batch for configuration units and apply any that changed.
    ///
    /// Returns the configuration to use for this cycle. When the batch carries
    /// no configuration unit the stored configuration is returned unchanged.
    pub fn refresh(&self, units: &[SourceUnit]) -> Result<Arc<ProjectConfig>, CompileCacheError> {
        let root_unit = find_role(units, |u| u.is_root_config());
        let server_unit = find_role(units, |u| u.is_server_config());

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let root_changed = is_changed(&state.root, root_unit);
        let server_changed = is_changed(&state.server, server_unit);

        if !root_changed && !server_changed {
            debug!(
                service = services::CONFIG_STORE,
                operation = operations::REFRESH,
                status = status::HIT,
                "configuration unchanged"
            );
            return Ok(Arc::clone(&state.current));
        }

        let new_root = match (root_changed, root_unit) {
            (true, Some(unit)) => Some(self.parse_unit(unit)?),
            _ => state.root.clone(),
        };
        let new_server = match (server_changed, server_unit) {
            (true, Some(unit)) => Some(self.parse_unit(unit)?),
            _ => state.server.clone(),
        };

        let config = ProjectConfig::build(
            new_root.as_ref().map(|d| (&d.fingerprint, &d.document)),
            new_server.as_ref().map(|d| (&d.fingerprint, &d.document)),
            &self.extra_options,
        )
        .map_err(|e| {
            let path = if server_changed {
                crate::unit::SERVER_CONFIG_PATH
            } else {
                crate::unit::ROOT_CONFIG_PATH
            };
            self.fail(path, e)
        })?;

        let config = Arc::new(config);
        log_config_changes(&state.current, &config);

        state.root = new_root;
        state.server = new_server;
        state.current = Arc::clone(&config);

        info!(
            service = services::CONFIG_STORE,
            operation = operations::REFRESH,
            status = status::SUCCESS,
            config = %config.fingerprint().short(),
            "Configuration reloaded"
        );
        let _ = self.reload_tx.send(ReloadEvent::Reloaded(Arc::clone(&config)));

        Ok(config)
    }

    fn parse_unit(&self, unit: &SourceUnit) -> Result<StoredDocument, CompileCacheError> {
        let document = ConfigDocument::parse(unit.contents()).map_err(|e| self.fail(unit.path(), e))?;
        Ok(StoredDocument {
            fingerprint: unit.fingerprint(),
            document,
        })
    }

    fn fail(&self, path: &str, error: anyhow::Error) -> CompileCacheError {
        let message = format!("{:#}", error);
        warn!(
            service = services::CONFIG_STORE,
            operation = operations::REFRESH,
            status = status::ERROR,
            path,
            "Invalid configuration: {}",
            message
        );
        let _ = self
            .reload_tx
            .send(ReloadEvent::Failed(format!("{}: {}", path, message)));
        CompileCacheError::ConfigInvalid {
            path: path.to_string(),
            message,
        }
    }
}

/// First unit playing a configuration role. Hosts hand the same configuration
/// to every platform, so later copies are only checked for consistency.
fn find_role(units: &[SourceUnit], role: impl Fn(&SourceUnit) -> bool) -> Option<&SourceUnit> {
    let mut matching = units.iter().filter(|u| role(*u));
    let first = matching.next()?;
    if matching.any(|u| u.fingerprint() != first.fingerprint()) {
        warn!(
            service = services::CONFIG_STORE,
            path = first.path(),
            "Differing copies of the same configuration unit in one batch, using the first"
        );
    }
    Some(first)
}

fn is_changed(stored: &Option<StoredDocument>, unit: Option<&SourceUnit>) -> bool {
    match (stored, unit) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(stored), Some(unit)) => stored.fingerprint != unit.fingerprint(),
    }
}

fn log_config_changes(old: &ProjectConfig, new: &ProjectConfig) {
    let old_options = old.base_options();
    let new_options = new.base_options();

    if old_options.module != new_options.module {
        info!(
            "Module kind changed: {} -> {}",
            old_options.module, new_options.module
        );
    }
    if old_options.target != new_options.target {
        info!(
            "Target changed: {} -> {}",
            old_options.target, new_options.target
        );
    }
    if old.exclude != new.exclude {
        info!(
            "Exclude patterns changed: {} -> {} patterns",
            old.exclude.len(),
            new.exclude.len()
        );
    }
    if old.has_server_overrides() != new.has_server_overrides() {
        info!(
            "Server override configuration {}",
            if new.has_server_overrides() {
                "added"
            } else {
                "removed"
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ModuleKind, ScriptTarget};
    use crate::unit::Platform;

    fn config_unit(json: &str) -> SourceUnit {
        SourceUnit::new("tsconfig.json", json, "web.browser")
    }

    #[test]
    fn test_no_config_returns_defaults() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let config = store.refresh(&[]).unwrap();
        assert_eq!(config.base_options().module, ModuleKind::System);
    }

    #[test]
    fn test_unchanged_config_reuses_instance() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let units = vec![config_unit(r#"{"compilerOptions": {"module": "commonjs"}}"#)];

        let first = store.refresh(&units).unwrap();
        let second = store.refresh(&units).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.base_options().module, ModuleKind::CommonJs);
    }

    #[test]
    fn test_changed_config_reparses() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let first = store
            .refresh(&[config_unit(r#"{"compilerOptions": {"module": "commonjs"}}"#)])
            .unwrap();
        let second = store
            .refresh(&[config_unit(r#"{"compilerOptions": {"module": "system"}}"#)])
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.fingerprint(), second.fingerprint());
        assert_eq!(second.base_options().module, ModuleKind::System);
    }

    #[test]
    fn test_missing_config_keeps_previous() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let first = store
            .refresh(&[config_unit(r#"{"compilerOptions": {"module": "amd"}}"#)])
            .unwrap();
        let second = store.refresh(&[]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalid_config_fails_and_keeps_state() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let good = store
            .refresh(&[config_unit(r#"{"compilerOptions": {"module": "amd"}}"#)])
            .unwrap();

        let err = store.refresh(&[config_unit("{not json")]).unwrap_err();
        assert!(matches!(err, CompileCacheError::ConfigInvalid { ref path, .. } if path == "tsconfig.json"));

        // The stored fingerprint was not updated, so the bad unit fails again
        assert!(store.refresh(&[config_unit("{not json")]).is_err());
        assert!(Arc::ptr_eq(&good, &store.current()));
    }

    #[test]
    fn test_server_config_role() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let units = vec![
            config_unit(r#"{"compilerOptions": {"target": "es5"}}"#),
            SourceUnit::new(
                "server/tsconfig.json",
                r#"{"compilerOptions": {"target": "es6"}}"#,
                "os",
            ),
        ];
        let config = store.refresh(&units).unwrap();
        assert_eq!(
            config.options_for(&Platform::new("os")).target,
            ScriptTarget::Es6
        );
        assert_eq!(
            config.options_for(&Platform::new("web.browser")).target,
            ScriptTarget::Es5
        );
    }

    #[test]
    fn test_reload_events_broadcast() {
        let store = ConfigStore::new(Map::new()).unwrap();
        let mut events = store.subscribe();

        store
            .refresh(&[config_unit(r#"{"compilerOptions": {"module": "umd"}}"#)])
            .unwrap();
        assert!(matches!(events.try_recv(), Ok(ReloadEvent::Reloaded(_))));

        let _ = store.refresh(&[config_unit("[")]);
        assert!(matches!(events.try_recv(), Ok(ReloadEvent::Failed(_))));
    }

    #[test]
    fn test_invalid_extra_options_rejected() {
        let mut extra = Map::new();
        extra.insert("module".to_string(), Value::String("nope".to_string()));
        assert!(matches!(
            ConfigStore::new(extra),
            Err(CompileCacheError::EngineConfig(_))
        ));
    }
}
