//! Process-wide cache of managers keyed by resolved identity.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::model::ManagerOptions;
use super::{exit, Manager};
use crate::error::StoreError;
use crate::paths;

const TEST_PREFIX: &str = "test:";

/// Normalized key identifying one configuration.
///
/// `explicit:<absolute path>` for a given file, `auto:<working directory>`
/// when the path is discovered, each prefixed with `test:` in test mode.
/// Separators are always forward slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Key for a caller-supplied path.
    pub fn explicit(path: &Path, test_mode: bool) -> Result<Self, StoreError> {
        let absolute = paths::absolute(path)?;
        Ok(Self::build("explicit", &absolute, test_mode))
    }

    /// Key for the path resolved from `working_dir`.
    pub fn auto(working_dir: &Path, test_mode: bool) -> Result<Self, StoreError> {
        let absolute = paths::absolute(working_dir)?;
        Ok(Self::build("auto", &absolute, test_mode))
    }

    /// The key a manager built from `options` is cached under.
    pub fn for_options(options: &ManagerOptions) -> Result<Self, StoreError> {
        let test_mode = options.settings.test_mode;
        match &options.path {
            Some(path) => Self::explicit(path, test_mode),
            None => Self::auto(&paths::current_dir()?, test_mode),
        }
    }

    fn build(kind: &str, path: &Path, test_mode: bool) -> Self {
        let prefix = if test_mode { TEST_PREFIX } else { "" };
        Self(format!(
            "{}{}:{}",
            prefix,
            kind,
            path.to_string_lossy().replace('\\', "/")
        ))
    }

    /// The normalized key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key belongs to a test-mode manager.
    pub fn is_test(&self) -> bool {
        self.0.starts_with(TEST_PREFIX)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// At most one live manager per [`IdentityKey`].
///
/// Lookups take a read lock; construction is serialized behind a separate
/// mutex and re-checks the cache before building.
#[derive(Default)]
pub struct Registry {
    instances: RwLock<HashMap<IdentityKey, Manager>>,
    construction: Mutex<()>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Cached, still open manager for `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<Manager> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|manager| !manager.is_closed())
            .cloned()
    }

    /// Returns the manager cached under `key`, building it with `constructor`
    /// if there is none.
    ///
    /// A failed construction caches nothing, so the next call tries again.
    /// A closed manager in the cache is replaced.
    pub fn get_or_create<F>(&self, key: IdentityKey, constructor: F) -> Result<Manager, StoreError>
    where
        F: FnOnce() -> Result<Manager, StoreError>,
    {
        if let Some(manager) = self.get(&key) {
            return Ok(manager);
        }

        let _guard = self.construction.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(manager) = self.get(&key) {
            return Ok(manager);
        }

        let manager = constructor().map_err(|e| {
            debug!(key = %key, error = %e, "Construction failed, nothing cached");
            e
        })?;
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), manager.clone());
        debug!(key = %key, "Cached new config manager");
        Ok(manager)
    }

    /// Manager for `options`, shared with every caller resolving to the same key.
    pub fn open(&self, options: ManagerOptions) -> Result<Manager, StoreError> {
        let key = IdentityKey::for_options(&options)?;
        self.get_or_create(key, move || Manager::open(options))
    }

    /// Number of cached managers.
    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no manager is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every cached manager.
    pub fn keys(&self) -> Vec<IdentityKey> {
        let mut keys: Vec<_> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Closes every cached manager and empties the cache.
    ///
    /// Close failures are logged and do not stop the others.
    pub fn clear_all(&self) {
        let drained: Vec<(IdentityKey, Manager)> = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (key, manager) in &drained {
            if panic::catch_unwind(AssertUnwindSafe(|| manager.close())).is_err() {
                warn!(key = %key, "Panic while closing config manager");
            }
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Cleared config managers");
        }
    }

    /// [`Registry::clear_all`] plus a flush of every other live manager.
    pub fn shutdown_all(&self) {
        self.clear_all();
        exit::flush_all();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Background;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options(path: impl Into<std::path::PathBuf>) -> ManagerOptions {
        ManagerOptions::new()
            .path(path)
            .watch(false)
            .background(Arc::new(Background::new("registry-test")))
    }

    #[test]
    fn keys_are_normalized() {
        let absolute = std::env::current_dir().unwrap().join("conf").join("app.yaml");
        let a = IdentityKey::explicit(Path::new("conf/./app.yaml"), false).unwrap();
        let b = IdentityKey::explicit(Path::new("conf\\app.yaml"), false).unwrap();
        let c = IdentityKey::explicit(&absolute, false).unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(a.as_str().starts_with("explicit:"));
    }

    #[test]
    fn test_mode_gets_its_own_key() {
        let plain = IdentityKey::explicit(Path::new("/srv/app.yaml"), false).unwrap();
        let test = IdentityKey::explicit(Path::new("/srv/app.yaml"), true).unwrap();

        assert_ne!(plain, test);
        assert!(test.is_test());
        assert_eq!(test.as_str(), "test:explicit:/srv/app.yaml");
    }

    #[test]
    fn auto_key_uses_working_directory() {
        let key = IdentityKey::for_options(&ManagerOptions::new()).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(key, IdentityKey::auto(&cwd, false).unwrap());
        assert!(key.as_str().starts_with("auto:"));
    }

    #[test]
    fn concurrent_first_access_builds_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let registry = Arc::new(Registry::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let key = IdentityKey::explicit(&path, false).unwrap();
                    registry
                        .get_or_create(key, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Manager::open(options(&path))
                        })
                        .unwrap()
                })
            })
            .collect();

        let managers: Vec<Manager> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(managers.iter().all(|m| Manager::ptr_eq(m, &managers[0])));
        registry.clear_all();
    }

    #[test]
    fn failed_construction_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let registry = Registry::new();
        let key = IdentityKey::explicit(&path, false).unwrap();

        let err = registry
            .get_or_create(key.clone(), || {
                Err(StoreError::NotFound { path: path.clone() })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(registry.is_empty());

        let manager = registry.get_or_create(key.clone(), || Manager::open(options(&path))).unwrap();
        assert!(Manager::ptr_eq(&manager, &registry.get(&key).unwrap()));
        registry.clear_all();
    }

    #[test]
    fn different_paths_get_different_managers() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let a = registry.open(options(dir.path().join("a.yaml"))).unwrap();
        let b = registry.open(options(dir.path().join("b.yaml"))).unwrap();

        assert!(!Manager::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        registry.clear_all();
    }

    #[test]
    fn clear_all_closes_and_empties() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let manager = registry.open(options(dir.path().join("config.yaml"))).unwrap();

        registry.clear_all();
        registry.clear_all();

        assert!(manager.is_closed());
        assert!(registry.is_empty());

        let reopened = registry.open(options(dir.path().join("config.yaml"))).unwrap();
        assert!(!Manager::ptr_eq(&manager, &reopened));
        registry.clear_all();
    }
}
