//! Store settings and manager construction options.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::hot_reload::WatcherSettings;
use super::loader::{Persistence, YamlFile};
use crate::error::StoreError;
use crate::runtime::Background;

/// Zero-argument predicate consulted whenever `debug_mode` is read.
pub type DebugDetector = Arc<dyn Fn() -> bool + Send + Sync>;

/// Tunable behaviour of a manager, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Debounce delay between the last write and the autosave.
    #[serde(default = "default_autosave_delay_ms")]
    pub autosave_delay_ms: u64,

    /// Whether to poll the file for external changes.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Create an empty config when the file does not exist.
    #[serde(default = "default_true")]
    pub auto_create: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Window after an own save during which a file change is not reloaded.
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    /// Longest wait for the watcher to stop on close.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Work on an isolated copy under the temp directory.
    #[serde(default)]
    pub test_mode: bool,
}

fn default_autosave_delay_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_grace_window_ms() -> u64 {
    2000
}

fn default_stop_timeout_ms() -> u64 {
    1500
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            autosave_delay_ms: default_autosave_delay_ms(),
            watch: true,
            auto_create: true,
            poll_interval_ms: default_poll_interval_ms(),
            grace_window_ms: default_grace_window_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            test_mode: false,
        }
    }
}

impl StoreSettings {
    /// Reads settings from a YAML file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| StoreError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Debounce delay for autosave.
    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    /// Polling settings for the change watcher.
    pub fn watcher(&self) -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_window: Duration::from_millis(self.grace_window_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

/// Everything needed to build a manager.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Explicit config file; resolved from the working directory when absent.
    pub path: Option<PathBuf>,
    pub settings: StoreSettings,
    pub persistence: Arc<dyn Persistence>,
    pub debug_detector: Option<DebugDetector>,
    pub background: Arc<Background>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            path: None,
            settings: StoreSettings::default(),
            persistence: Arc::new(YamlFile),
            debug_detector: None,
            background: Background::global(),
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("path", &self.path)
            .field("settings", &self.settings)
            .field("debug_detector", &self.debug_detector.is_some())
            .finish_non_exhaustive()
    }
}

impl ManagerOptions {
    /// Default options: resolved path, YAML file, global runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit config file path.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replaces all store settings.
    pub fn settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the autosave debounce delay.
    pub fn autosave_delay(mut self, delay: Duration) -> Self {
        self.settings.autosave_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets how often the file mtime is polled.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets how long a self-save mark stays valid.
    pub fn grace_window(mut self, window: Duration) -> Self {
        self.settings.grace_window_ms = window.as_millis() as u64;
        self
    }

    /// Enables or disables external change watching.
    pub fn watch(mut self, enabled: bool) -> Self {
        self.settings.watch = enabled;
        self
    }

    /// Whether a missing file is created empty.
    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.settings.auto_create = enabled;
        self
    }

    /// Works on an isolated copy of the config.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.settings.test_mode = enabled;
        self
    }

    /// Replaces the YAML file adapter.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Source of the derived `debug_mode` value.
    pub fn debug_detector(mut self, detector: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.debug_detector = Some(Arc::new(detector));
        self
    }

    /// Runs timers and watchers on `background`.
    pub fn background(mut self, background: Arc<Background>) -> Self {
        self.background = background;
        self
    }
}

/// A detector that reads `var` from the environment on every call.
///
/// `1`, `true`, `yes` and `on` (any case) count as enabled.
pub fn env_debug_detector(var: impl Into<String>) -> DebugDetector {
    let var = var.into();
    Arc::new(move || {
        std::env::var(&var)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    })
}
