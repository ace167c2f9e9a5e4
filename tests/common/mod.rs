//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use config_store::config::loader::{Document, Persistence, YamlFile};
use config_store::runtime::Background;
use config_store::{ManagerOptions, StoreError};

pub const AUTOSAVE_DELAY: Duration = Duration::from_millis(40);
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Options with short timings and a private background runtime.
pub fn fast_options(path: &Path) -> ManagerOptions {
    ManagerOptions::new()
        .path(path)
        .autosave_delay(AUTOSAVE_DELAY)
        .poll_interval(POLL_INTERVAL)
        .background(Arc::new(Background::new("integration-test")))
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Rewrites `path` as another process would, pushing its mtime clearly forward.
pub fn write_externally(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
}

/// YAML persistence that counts writes to the primary file.
pub struct CountingPersistence {
    primary: PathBuf,
    saves: AtomicUsize,
}

impl CountingPersistence {
    pub fn new(primary: &Path) -> Arc<Self> {
        Arc::new(Self {
            primary: primary.to_path_buf(),
            saves: AtomicUsize::new(0),
        })
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Persistence for CountingPersistence {
    fn load(&self, path: &Path) -> Result<Document, StoreError> {
        YamlFile.load(path)
    }

    fn save(&self, path: &Path, document: &Document) -> Result<(), StoreError> {
        if path == self.primary {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        YamlFile.save(path, document)
    }
}
