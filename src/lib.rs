//! Config Store - a persisted, hierarchical runtime configuration tree.
//!
//! Values live in a tree of [`Node`]s rooted at a [`Manager`]. Writes are
//! saved to a YAML file after a short debounce, external edits to the file
//! are picked up by a polling watcher, and a process-wide [`Registry`] hands
//! out one manager per configuration file.

pub mod cli;
pub mod config;
pub mod error;
pub mod node;
pub mod paths;
pub mod runtime;

pub use crate::config::{
    IdentityKey, Manager, ManagerOptions, ManagerState, Registry, ReloadEvent, StoreSettings,
};
pub use crate::error::{SpawnError, StoreError};
pub use crate::node::{Node, Value};

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::model::env_debug_detector;

/// Environment variable consulted for the `debug_mode` field.
pub const DEBUG_ENV_VAR: &str = "CONFIG_STORE_DEBUG";

/// Runs the command line tool with the provided arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    if let Commands::CleanTests { days } = cli.command {
        let removed = paths::cleanup_old_test_environments(days);
        println!("Removed {} test environment(s).", removed);
        return Ok(());
    }

    let manager = open_manager(&cli)?;
    let result = match &cli.command {
        Commands::Show { json } => show(&manager, *json),
        Commands::Get { key } => get(&manager, key),
        Commands::Set { key, value } => set(&manager, key, value),
        Commands::Unset { key } => unset(&manager, key),
        Commands::Backups => backups(&manager),
        Commands::Watch => watch(&manager).await,
        Commands::CleanTests { .. } => Ok(()),
    };

    Registry::global().shutdown_all();
    result
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn open_manager(cli: &Cli) -> Result<Manager> {
    let mut settings = match &cli.settings {
        Some(path) => StoreSettings::from_file(path)
            .with_context(|| format!("Failed to load store settings from '{}'", path.display()))?,
        None => StoreSettings::default(),
    };
    if cli.test_mode {
        settings.test_mode = true;
    }

    let mut options = ManagerOptions::new().settings(settings);
    options.debug_detector = Some(env_debug_detector(DEBUG_ENV_VAR));
    if let Some(path) = &cli.config {
        options = options.path(path);
    }

    let manager = Registry::global()
        .open(options)
        .context("Failed to open configuration")?;
    info!(path = %manager.path().display(), "Opened configuration");
    Ok(manager)
}

fn show(manager: &Manager, json: bool) -> Result<()> {
    let output = if json {
        serde_json::to_string_pretty(&*manager.read())?
    } else {
        serde_yaml::to_string(&manager.to_mapping())?
    };
    println!("{}", output.trim_end());
    Ok(())
}

fn get(manager: &Manager, key: &str) -> Result<()> {
    match manager.get(key) {
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => bail!("No value at '{}'", key),
    }
}

fn set(manager: &Manager, key: &str, raw: &str) -> Result<()> {
    manager.set(key, Value::parse_literal(raw));
    if !manager.contains(key) {
        bail!("'{}' cannot be set", key);
    }
    manager.save().context("Failed to save configuration")?;
    println!("{} = {}", key, raw);
    Ok(())
}

fn unset(manager: &Manager, key: &str) -> Result<()> {
    if manager.remove(key).is_none() {
        bail!("No value at '{}'", key);
    }
    manager.save().context("Failed to save configuration")?;
    println!("Removed '{}'.", key);
    Ok(())
}

fn backups(manager: &Manager) -> Result<()> {
    let backups = manager.list_backups();
    if backups.is_empty() {
        println!("No backups for {}.", manager.path().display());
        return Ok(());
    }
    println!("Backups ({}):", backups.len());
    for backup in backups {
        println!("  {}", backup.display());
    }
    Ok(())
}

async fn watch(manager: &Manager) -> Result<()> {
    let mut events = manager.subscribe();
    println!("Watching {} (Ctrl+C to stop)", manager.path().display());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(ReloadEvent::Reloaded) => println!("reloaded"),
                Ok(ReloadEvent::ReloadFailed { message }) => println!("reload failed: {}", message),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed reload events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
