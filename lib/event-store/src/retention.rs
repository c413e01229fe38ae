//! Retention: whole hour files older than the window are deleted.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::StoreConfig;

/// Deletes hour files (including quarantined ones) whose modification time
/// is older than `window`. Returns the number of files removed.
pub async fn sweep_once(data_dir: &Path, window: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now() - window;
    let mut removed = 0;

    let mut entries = tokio::fs::read_dir(data_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.starts_with("events-") {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(file = %name, %error, "cannot stat hour file during sweep");
                continue;
            }
        };
        let mtime = match metadata.modified() {
            Ok(mtime) => mtime,
            Err(_) => continue,
        };

        if mtime < cutoff {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!(file = %name, "deleted expired hour file");
                    removed += 1;
                }
                Err(error) => {
                    warn!(file = %name, %error, "cannot delete expired hour file");
                }
            }
        }
    }

    Ok(removed)
}

/// Periodic retention sweep task.
#[derive(Debug)]
pub struct RetentionSweeper {
    config: StoreConfig,
}

impl RetentionSweeper {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Runs forever; callers race this against their shutdown signal.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_once(self.config.data_dir(), self.config.retention_window()).await {
                Ok(removed) if removed > 0 => {
                    debug!(removed, "retention sweep complete");
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "retention sweep failed");
                }
            }
        }
    }
}
