//! Settings store (C1): cached, atomically-persisted settings document.

use std::{path::PathBuf, sync::Arc};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::{document::SettingsDocument, env};

/// Broadcast to C3/C4/C8 whenever the cached document changes, whether
/// through `save()` or an external `reload()`.
#[derive(Debug, Clone)]
pub struct SettingsChangeEvent {
    pub document: Arc<SettingsDocument>,
}

/// Authoritative in-memory view of the settings file plus its persistence.
///
/// Readers take a snapshot of the `Arc<SettingsDocument>` pointer under the
/// lock and then release it immediately; the lock is only ever held for the
/// duration of a pointer copy or swap, never across I/O.
pub struct SettingsStore {
    path: PathBuf,
    cached: RwLock<Option<Arc<SettingsDocument>>>,
    changes: broadcast::Sender<SettingsChangeEvent>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        let (changes, _rx) = broadcast::channel(32);
        Self {
            path,
            cached: RwLock::new(None),
            changes,
        }
    }

    /// Resolve the settings path per §6: `MCPHUB_SETTING_PATH` env var, else
    /// `./mcp_settings.json`.
    pub fn from_env() -> Self {
        let path = std::env::var("MCPHUB_SETTING_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./mcp_settings.json"));
        Self::new(path)
    }

    /// Returns the cached document, reading and parsing the file on first
    /// access. A corrupted or unreadable file is never fatal: it becomes an
    /// empty document and the error is logged (§4.1 failure policy).
    pub async fn load(&self) -> Arc<SettingsDocument> {
        if let Some(doc) = self.cached.read().clone() {
            return doc;
        }
        let doc = Arc::new(self.read_from_disk().await);
        *self.cached.write() = Some(doc.clone());
        doc
    }

    async fn read_from_disk(&self) -> SettingsDocument {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<SettingsDocument>(&text) {
                Ok(raw) => env_expand_document(raw),
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "settings file failed to parse, treating as empty");
                    SettingsDocument::empty()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsDocument::empty(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "settings file unreadable, treating as empty");
                SettingsDocument::empty()
            }
        }
    }

    /// Merge `doc` into the cached original and atomically rewrite the file.
    /// `as_user` is accepted for the admin-API audit trail (§6) but does not
    /// change persistence semantics.
    pub async fn save(
        &self,
        doc: SettingsDocument,
        _as_user: Option<&str>,
    ) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(&doc).expect("SettingsDocument always serializes");
        self.write_atomic(&text).await?;

        let shared = Arc::new(doc);
        *self.cached.write() = Some(shared.clone());
        let _ = self.changes.send(SettingsChangeEvent { document: shared });
        Ok(())
    }

    async fn write_atomic(&self, text: &str) -> std::io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("mcp_settings.json")
        ));
        tokio::fs::write(&tmp_path, text).await?;
        tokio::fs::rename(&tmp_path, &self.path).await
    }

    /// Drop the cache, forcing the next `load()` to re-read from disk.
    pub fn clear_cache(&self) {
        *self.cached.write() = None;
    }

    /// Force a re-read from disk now and broadcast the result, regardless of
    /// whether the content changed.
    pub async fn reload(&self) -> Arc<SettingsDocument> {
        self.clear_cache();
        let doc = self.load().await;
        let _ = self.changes.send(SettingsChangeEvent {
            document: doc.clone(),
        });
        doc
    }

    /// Subscribe to reload notifications. A lagging subscriber only misses
    /// intermediate events; the latest document is always available via a
    /// fresh `load()`.
    pub fn on_change(&self) -> broadcast::Receiver<SettingsChangeEvent> {
        self.changes.subscribe()
    }

    /// Watches the settings file's parent directory for out-of-band edits
    /// (an operator hand-editing the file, a config-management tool dropping
    /// a new version) and reloads on the next modify/create event that
    /// touches the settings path. The returned watcher must be kept alive
    /// for the lifetime of the watch; dropping it stops delivery.
    pub fn spawn_file_watcher(self: &Arc<Self>) -> std::io::Result<RecommendedWatcher> {
        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let target = self.path.clone();
        let store = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "settings file watcher error");
                    return;
                }
            };
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                return;
            }
            if !event.paths.iter().any(|p| p == &target) {
                return;
            }
            let store = Arc::clone(&store);
            handle.spawn(async move {
                info!(path = %store.path.display(), "settings file changed on disk, reloading");
                store.reload().await;
            });
        })
        .map_err(|e| std::io::Error::other(format!("failed to create settings file watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| std::io::Error::other(format!("failed to watch {}: {e}", watch_dir.display())))?;

        Ok(watcher)
    }
}

/// Expands every string leaf in the document (§4.1 "any string in settings
/// may contain `${VAR}`/`$VAR`"; §6 "all string fields undergo expansion at
/// load"), via a serialize -> expand -> deserialize round trip rather than
/// hand-picking fields, so newly added string fields are covered for free.
/// Map/object keys are left untouched by `expand_value`, which matches
/// `mcpServers`/`userConfigs` needing their keys to stay literal names.
fn env_expand_document(raw: SettingsDocument) -> SettingsDocument {
    let value = serde_json::to_value(&raw).expect("SettingsDocument always serializes");
    let expanded = env::expand_value(&value);
    serde_json::from_value(expanded).unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn missing_file_loads_as_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("does_not_exist.json"));
        let doc = store.load().await;
        assert!(doc.mcp_servers.is_empty());
    }

    #[tokio::test]
    async fn corrupted_file_is_treated_as_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let store = SettingsStore::new(path);
        let doc = store.load().await;
        assert!(doc.mcp_servers.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("mcp_settings.json"));
        let mut doc = SettingsDocument::empty();
        doc.system_config.routing.skip_auth = true;
        store.save(doc, None).await.unwrap();

        store.clear_cache();
        let reloaded = store.load().await;
        assert!(reloaded.system_config.routing.skip_auth);
    }

    #[tokio::test]
    async fn on_change_receives_save_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("mcp_settings.json"));
        let mut rx = store.on_change();
        store.save(SettingsDocument::empty(), None).await.unwrap();
        let event = rx.try_recv().expect("expected a change event");
        assert!(event.document.mcp_servers.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn load_expands_env_vars_but_disk_stays_unexpanded() {
        std::env::set_var("MCPHUB_STORE_TEST", "expanded-value");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        tokio::fs::write(
            &path,
            br#"{"mcpServers":{"s":{"type":"stdio","command":"${MCPHUB_STORE_TEST}"}}}"#,
        )
        .await
        .unwrap();

        let store = SettingsStore::new(path.clone());
        let doc = store.load().await;
        assert_eq!(
            doc.mcp_servers["s"].command.as_deref(),
            Some("expanded-value")
        );

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(on_disk.contains("${MCPHUB_STORE_TEST}"));
        std::env::remove_var("MCPHUB_STORE_TEST");
    }

    #[tokio::test]
    #[serial]
    async fn load_expands_previously_missed_fields() {
        std::env::set_var("MCPHUB_ROUTER_KEY", "router-key-value");
        std::env::set_var("MCPHUB_INSTALL_BASE", "https://install.example");
        std::env::set_var("MCPHUB_OPENAPI_SEC_NAME", "X-Api-Key");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        tokio::fs::write(
            &path,
            br#"{
                "mcpServers": {
                    "s": {
                        "type": "openapi",
                        "openapi": {
                            "url": "https://api.example",
                            "security": {"type": "apiKey", "name": "${MCPHUB_OPENAPI_SEC_NAME}"}
                        }
                    }
                },
                "systemConfig": {
                    "install": {"baseUrl": "${MCPHUB_INSTALL_BASE}"},
                    "mcpRouter": {"apiKey": "${MCPHUB_ROUTER_KEY}"}
                }
            }"#,
        )
        .await
        .unwrap();

        let store = SettingsStore::new(path);
        let doc = store.load().await;
        assert_eq!(
            doc.system_config.mcp_router.api_key.as_deref(),
            Some("router-key-value")
        );
        assert_eq!(
            doc.system_config.install.base_url.as_deref(),
            Some("https://install.example")
        );
        assert_eq!(
            doc.mcp_servers["s"]
                .openapi
                .as_ref()
                .unwrap()
                .security
                .as_ref()
                .unwrap()
                .name
                .as_deref(),
            Some("X-Api-Key")
        );

        std::env::remove_var("MCPHUB_ROUTER_KEY");
        std::env::remove_var("MCPHUB_INSTALL_BASE");
        std::env::remove_var("MCPHUB_OPENAPI_SEC_NAME");
    }

    #[tokio::test]
    async fn file_watcher_reloads_on_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        tokio::fs::write(&path, br#"{"mcpServers":{}}"#).await.unwrap();

        let store = Arc::new(SettingsStore::new(path.clone()));
        let mut rx = store.on_change();
        let _watcher = store.spawn_file_watcher().unwrap();

        tokio::fs::write(&path, br#"{"mcpServers":{},"systemConfig":{"routing":{"skipAuth":true}}}"#)
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("expected a reload event within the timeout")
            .unwrap();
        assert!(event.document.system_config.routing.skip_auth);
    }
}
