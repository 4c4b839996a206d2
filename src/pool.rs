//! Connector pool (C3): owns one [`Connector`] per enabled server, keyed by
//! name, and reconciles the set against settings reloads.

use std::{collections::HashSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::{
    connector::Connector,
    settings::{ServerConfig, SettingsDocument, SettingsStore},
};

/// Boot budget: `initialize()` is allowed to exhaust its first retry before
/// `boot()` gives up waiting on it (§4.3, default 300s).
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ConnectorPool {
    connectors: DashMap<String, Arc<Connector>>,
    init_timeout: Duration,
    /// Serializes whole reconcile passes so a settings reload that arrives
    /// mid-reconcile can't race the diff it's computing (§4.3).
    reconcile_lock: AsyncMutex<()>,
}

impl ConnectorPool {
    pub fn new(init_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connectors: DashMap::new(),
            init_timeout,
            reconcile_lock: AsyncMutex::new(()),
        })
    }

    /// Initializes every enabled connector concurrently and waits up to
    /// `init_timeout` for the round to settle; connectors still `connecting`
    /// past the deadline keep retrying in the background (§4.3).
    pub async fn boot(self: &Arc<Self>, document: &SettingsDocument) {
        let _guard = self.reconcile_lock.lock().await;
        for (name, config) in &document.mcp_servers {
            if !config.enabled {
                continue;
            }
            let connector = Connector::new(name.clone(), config.clone());
            self.connectors.insert(name.clone(), Arc::clone(&connector));
        }

        let initializations = self
            .connectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .map(|connector| async move { connector.initialize(false).await });

        if tokio::time::timeout(self.init_timeout, futures::future::join_all(initializations))
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.init_timeout.as_secs(),
                "connector pool boot timed out; connectors keep retrying in the background"
            );
        }
    }

    /// Computes the diff between the currently running set and `document`,
    /// and applies it: newly-added servers are initialized, removed servers
    /// are disconnected and dropped, disabled servers are disconnected but
    /// kept (so a later re-enable doesn't need a process restart), and
    /// config-changed servers are force re-initialized (§4.3).
    pub async fn reconcile(self: &Arc<Self>, document: &SettingsDocument) {
        let _guard = self.reconcile_lock.lock().await;
        let diff = compute_diff(&self.connectors, document);

        for name in &diff.removed {
            if let Some((_, connector)) = self.connectors.remove(name) {
                connector.disconnect().await;
                info!(server = %name, "connector removed");
            }
        }

        for name in &diff.added {
            let Some(config) = document.mcp_servers.get(name) else {
                continue;
            };
            let connector = Connector::new(name.clone(), config.clone());
            self.connectors.insert(name.clone(), Arc::clone(&connector));
            if config.enabled {
                connector.initialize(false).await;
            }
            info!(server = %name, "connector added");
        }

        for name in &diff.disabled {
            if let Some(connector) = self.get(name) {
                if let Some(config) = document.mcp_servers.get(name) {
                    connector.update_config(config.clone());
                }
                connector.disconnect().await;
                info!(server = %name, "connector disabled");
            }
        }

        for name in &diff.changed {
            let Some(config) = document.mcp_servers.get(name) else {
                continue;
            };
            if let Some(connector) = self.get(name) {
                connector.update_config(config.clone());
                if config.enabled {
                    connector.disconnect().await;
                    connector.initialize(true).await;
                    info!(server = %name, "connector re-initialized after config change");
                }
            }
        }

        for name in &diff.enabled {
            if let Some(connector) = self.get(name) {
                if let Some(config) = document.mcp_servers.get(name) {
                    connector.update_config(config.clone());
                }
                connector.initialize(true).await;
                info!(server = %name, "connector enabled");
            }
        }
    }

    /// Subscribes to the store's change feed and reconciles on every event,
    /// for the lifetime of the returned task.
    pub fn spawn_watcher(self: &Arc<Self>, store: Arc<SettingsStore>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let mut changes = store.on_change();
        tokio::spawn(async move {
            while let Ok(event) = changes.recv().await {
                pool.reconcile(&event.document).await;
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connector>> {
        self.connectors.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<Arc<Connector>> {
        self.connectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// True iff every enabled connector is connected (§4.3).
    pub fn connected(&self) -> bool {
        self.connectors
            .iter()
            .all(|entry| !entry.value().is_enabled() || entry.value().is_connected())
    }
}

struct Diff {
    added: Vec<String>,
    removed: Vec<String>,
    enabled: Vec<String>,
    disabled: Vec<String>,
    changed: Vec<String>,
}

fn compute_diff(current: &DashMap<String, Arc<Connector>>, document: &SettingsDocument) -> Diff {
    let current_names: HashSet<String> = current.iter().map(|e| e.key().clone()).collect();
    let desired_names: HashSet<String> = document.mcp_servers.keys().cloned().collect();

    let added = desired_names.difference(&current_names).cloned().collect();
    let removed = current_names.difference(&desired_names).cloned().collect();

    let mut enabled = Vec::new();
    let mut disabled = Vec::new();
    let mut changed = Vec::new();

    for name in current_names.intersection(&desired_names) {
        let Some(new_config) = document.mcp_servers.get(name) else {
            continue;
        };
        let Some(connector) = current.get(name) else {
            continue;
        };
        let old_config = connector.value().config_snapshot();

        if old_config.enabled != new_config.enabled {
            if new_config.enabled {
                enabled.push(name.clone());
            } else {
                disabled.push(name.clone());
            }
            continue;
        }
        if new_config.enabled && config_changed(&old_config, new_config) {
            changed.push(name.clone());
        }
    }

    Diff {
        added,
        removed,
        enabled,
        disabled,
        changed,
    }
}

/// Structural comparison via serialization rather than a hand-maintained
/// field list, so a new `ServerConfig` field is covered automatically.
fn config_changed(old: &ServerConfig, new: &ServerConfig) -> bool {
    serde_json::to_value(old).ok() != serde_json::to_value(new).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ServerConfig, ServerKind};
    use std::collections::HashMap;

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig {
            kind: ServerKind::Stdio,
            enabled: true,
            owner: None,
            keep_alive_interval_secs: None,
            options: Default::default(),
            tools: HashMap::new(),
            command: Some(command.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            openapi: None,
        }
    }

    #[test]
    fn diff_detects_added_removed_and_changed() {
        let current = DashMap::new();
        current.insert(
            "stays".to_string(),
            Connector::new("stays".to_string(), stdio_config("old")),
        );
        current.insert(
            "dropped".to_string(),
            Connector::new("dropped".to_string(), stdio_config("x")),
        );

        let mut document = SettingsDocument::empty();
        document
            .mcp_servers
            .insert("stays".to_string(), stdio_config("new"));
        document
            .mcp_servers
            .insert("fresh".to_string(), stdio_config("y"));

        let diff = compute_diff(&current, &document);
        assert_eq!(diff.added, vec!["fresh".to_string()]);
        assert_eq!(diff.removed, vec!["dropped".to_string()]);
        assert_eq!(diff.changed, vec!["stays".to_string()]);
    }

    #[test]
    fn diff_detects_enable_disable_transitions() {
        let current = DashMap::new();
        let mut disabled_config = stdio_config("x");
        disabled_config.enabled = false;
        current.insert(
            "srv".to_string(),
            Connector::new("srv".to_string(), disabled_config),
        );

        let mut document = SettingsDocument::empty();
        document
            .mcp_servers
            .insert("srv".to_string(), stdio_config("x"));

        let diff = compute_diff(&current, &document);
        assert_eq!(diff.enabled, vec!["srv".to_string()]);
        assert!(diff.changed.is_empty());
    }
}
