//! Command-line interface for backrun.

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

/// Backrun - scheduled, observable, cancellable backups.
#[derive(Parser)]
#[command(name = "backrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, env = "BACKRUN_SETTINGS")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "BACKRUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Serve {
        /// Data directory (operation log and command output)
        #[arg(long, env = "BACKRUN_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Declarative config file
        #[arg(long, env = "BACKRUN_CONFIG_PATH")]
        config_path: Option<PathBuf>,

        /// Path to the restic binary
        #[arg(long)]
        restic: Option<PathBuf>,
    },

    /// Check a declarative config file without starting the daemon
    Validate {
        /// Config file to check (defaults to the configured config path)
        file: Option<PathBuf>,
    },

    /// List recorded operations
    #[command(group(ArgGroup::new("selector").args(["plan", "repo", "snapshot"])))]
    Operations {
        /// Only operations of this plan
        #[arg(long)]
        plan: Option<String>,

        /// Only operations of this repository
        #[arg(long)]
        repo: Option<String>,

        /// Only operations referring to this snapshot
        #[arg(long)]
        snapshot: Option<String>,

        /// Show at most this many of the most recent operations
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
