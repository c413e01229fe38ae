//! The live-reloadable watch list.
//!
//! The document enumerates the Group/Version/Resource triples to observe.
//! A filesystem watcher picks up edits (debounced), parses the new document,
//! and publishes it as an atomic snapshot; an invalid edit is logged and the
//! last good configuration keeps running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum WatchConfigError {
    #[snafu(display("cannot read watch config {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot parse watch config {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("cannot watch {}: {source}", path.display()))]
    Notify {
        path: PathBuf,
        source: notify::Error,
    },
}

/// One GVR to watch, with optional namespace and label-selector filters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WatchEntry {
    #[serde(default)]
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
    /// The kind the resource maps to, e.g. `Deployment`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
}

impl WatchEntry {
    pub fn gvr_key(&self) -> String {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        let suffix = self
            .namespace
            .as_deref()
            .map(|ns| format!("@{ns}"))
            .unwrap_or_default();
        format!("{group}/{}/{}{suffix}", self.version, self.resource)
    }
}

/// The parsed watch document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub watch: Vec<WatchEntry>,
}

impl WatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, WatchConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        serde_yaml::from_str(&raw).context(ParseSnafu { path })
    }
}

/// Publishes watch-list snapshots, starting from the file's current content
/// and re-reading it (debounced) whenever it changes.
pub struct ConfigWatcher {
    rx: watch::Receiver<Arc<WatchConfig>>,
    // Held so the notify backend keeps running.
    _watcher: notify::RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("entries", &self.rx.borrow().watch.len())
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    pub fn start(path: &Path) -> Result<Self, WatchConfigError> {
        let initial = Arc::new(WatchConfig::from_file(path)?);
        info!(
            path = %path.display(),
            entries = initial.watch.len(),
            "loaded watch configuration"
        );
        let (tx, rx) = watch::channel(initial);

        let (event_tx, event_rx) = std::sync::mpsc::channel::<()>();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        let _ = event_tx.send(());
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "watch config notification error"),
                }
            })
            .context(NotifySnafu { path })?;
        // Watch the parent directory: editors replace files, which would
        // otherwise orphan a file-level watch.
        let watch_target = path.parent().unwrap_or(path);
        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .context(NotifySnafu { path })?;

        let reload_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            while event_rx.recv().is_ok() {
                // Debounce: coalesce the burst of notifications an editor
                // save produces.
                while event_rx.recv_timeout(DEBOUNCE).is_ok() {}

                match WatchConfig::from_file(&reload_path) {
                    Ok(config) => {
                        info!(
                            path = %reload_path.display(),
                            entries = config.watch.len(),
                            "watch configuration reloaded"
                        );
                        if tx.send(Arc::new(config)).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        error!(
                            path = %reload_path.display(),
                            %error,
                            "invalid watch configuration, keeping last good one"
                        );
                    }
                }
            }
        });

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    /// Receiver of configuration snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<WatchConfig>> {
        self.rx.clone()
    }
}
