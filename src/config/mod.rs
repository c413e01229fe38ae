//! Process configuration.
//!
//! All configuration is an immutable value assembled once at startup and
//! passed to constructors. The only live-reloadable piece is the watch list
//! (which GVRs to observe); reloads swap a snapshot atomically rather than
//! mutating in place.

mod watch;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::graph::Neo4jConfig;

pub use self::watch::{ConfigWatcher, WatchConfig, WatchConfigError, WatchEntry};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("cannot read config file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot parse config file {}: {source}", path.display()))]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Which graph backend the server talks to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum GraphConfig {
    /// Process-local graph, suitable for development and tests.
    #[default]
    Memory,
    /// External Bolt endpoint.
    Neo4j {
        #[serde(default = "default_graph_uri")]
        uri: String,
        #[serde(default = "default_graph_user")]
        user: String,
        #[serde(default)]
        password: String,
        #[serde(default = "default_graph_database")]
        database: String,
    },
}

impl GraphConfig {
    pub fn neo4j(&self) -> Option<Neo4jConfig> {
        match self {
            GraphConfig::Memory => None,
            GraphConfig::Neo4j {
                uri,
                user,
                password,
                database,
            } => Some(Neo4jConfig {
                uri: uri.clone(),
                user: user.clone(),
                password: password.clone(),
                database: database.clone(),
            }),
        }
    }
}

fn default_graph_uri() -> String {
    "bolt://127.0.0.1:7687".to_string()
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/spectre/events")
}

fn default_watch_config_path() -> PathBuf {
    PathBuf::from("/etc/spectre/watch.yaml")
}

const fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

const fn default_block_size() -> usize {
    256 * 1024
}

const fn default_queue_capacity() -> usize {
    10_000
}

const fn default_reconcile_secs() -> u64 {
    600
}

const fn default_causality_window_secs() -> u64 {
    600
}

fn default_min_confidence() -> f64 {
    0.6
}

/// The immutable top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SpectreConfig {
    /// Directory for hour files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Watch-list document, live-reloaded.
    #[serde(default = "default_watch_config_path")]
    pub watch_config_path: PathBuf,

    #[serde(default)]
    pub graph: GraphConfig,

    /// Hour files older than this are deleted.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Uncompressed block size limit in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Pipeline worker count; defaults to the CPU count when zero.
    #[serde(default)]
    pub workers: usize,

    /// Watcher-to-pipeline queue capacity; overflow drops events.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_causality_window_secs")]
    pub causality_window_secs: u64,

    #[serde(default = "default_min_confidence")]
    pub causality_min_confidence: f64,
}

impl Default for SpectreConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default config must deserialize")
    }
}

impl SpectreConfig {
    /// Loads a YAML (or JSON; YAML is a superset) configuration file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        serde_yaml::from_str(&raw).context(ParseFileSnafu { path })
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn causality_window(&self) -> Duration {
        Duration::from_secs(self.causality_window_secs)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}
