//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "spectre", about = "Causal history for Kubernetes clusters", version)]
pub struct Opts {
    /// Log filter, e.g. `info` or `spectre=debug,kube=warn`.
    #[arg(long, global = true, env = "SPECTRE_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "SPECTRE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the watcher, storage, pipeline, reconciler, and query services.
    Server(ServerOpts),
    /// Write stored events for a time range to a JSON-lines file.
    Export(ExportOpts),
    /// Load events from a JSON-lines file into the store.
    Import(ImportOpts),
    /// Parse and report on the configuration files, then exit.
    ValidateConfig(ValidateConfigOpts),
}

#[derive(Debug, Args)]
pub struct ServerOpts {
    /// Path to the server configuration file.
    #[arg(long, env = "SPECTRE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ExportOpts {
    /// Storage directory holding the hour files.
    #[arg(long, env = "SPECTRE_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Range start, Unix seconds (or milliseconds).
    #[arg(long)]
    pub from: i64,

    /// Range end, Unix seconds (or milliseconds).
    #[arg(long)]
    pub to: i64,

    /// Output file; `-` writes to stdout.
    #[arg(long, default_value = "-")]
    pub output: String,
}

#[derive(Debug, Args)]
pub struct ImportOpts {
    /// Storage directory to import into.
    #[arg(long, env = "SPECTRE_DATA_DIR")]
    pub data_dir: PathBuf,

    /// JSON-lines input file produced by `export`.
    #[arg(long)]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct ValidateConfigOpts {
    #[arg(long, env = "SPECTRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Watch-list document to validate; defaults to the path the config
    /// names.
    #[arg(long)]
    pub watch_config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Opts::command().debug_assert();
    }

    #[test]
    fn export_requires_a_range() {
        let result = Opts::try_parse_from(["spectre", "export", "--data-dir", "/tmp/x"]);
        assert!(result.is_err());
    }
}
