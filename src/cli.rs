//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and edit a persisted configuration store.
#[derive(Parser, Debug)]
#[command(name = "cfgstore", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file. Discovered from the working directory when omitted.
    #[arg(short, long, env = "CONFIG_STORE_PATH", global = true)]
    pub config: Option<PathBuf>,

    /// YAML file with store settings (autosave delay, watcher timings, ...).
    #[arg(short, long, env = "CONFIG_STORE_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    /// Work on an isolated copy under the temp directory.
    #[arg(long, global = true)]
    pub test_mode: bool,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the whole configuration.
    Show {
        /// Print JSON instead of YAML.
        #[arg(long)]
        json: bool,
    },

    /// Print the value at a dotted path.
    Get {
        /// Dotted path, e.g. `server.port`.
        key: String,
    },

    /// Store a value at a dotted path.
    Set {
        key: String,

        /// Parsed as a YAML scalar or flow collection (`8080`, `true`, `[a, b]`).
        value: String,
    },

    /// Remove the value at a dotted path.
    Unset { key: String },

    /// List backup copies, newest first.
    Backups,

    /// Print a line for every external change until interrupted.
    Watch,

    /// Remove test environments older than the given number of days.
    #[command(name = "clean-tests")]
    CleanTests {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}
