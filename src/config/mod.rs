//! Configuration manager: the root of a persisted, watched config tree.

pub mod autosave;
pub mod exit;
pub mod hot_reload;
pub mod loader;
pub mod model;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::node::{Node, Root, RootRef, Value};
use crate::paths;

use self::autosave::AutosaveScheduler;
use self::hot_reload::{ChangeCallback, ChangeWatcher, WatchState};
use self::loader::{Document, Persistence};
use self::model::DebugDetector;

pub use self::loader::YamlFile;
pub use self::model::{ManagerOptions, StoreSettings};
pub use self::registry::{IdentityKey, Registry};

/// Data key holding the resolved config file path.
pub const CONFIG_FILE_PATH_KEY: &str = "config_file_path";
/// Data key holding the first start timestamp.
pub const FIRST_START_TIME_KEY: &str = "first_start_time";
/// Type hint recorded for timestamps.
pub const DATETIME_HINT: &str = "datetime";

const EVENT_CAPACITY: usize = 16;

/// Notifications sent after the watcher saw an external edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// The in-memory tree was replaced with the file's content.
    Reloaded,
    /// The file could not be loaded; the previous tree is still in place.
    ReloadFailed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Loading,
    Ready,
    Reloading,
    Closed,
}

/// Handle to a loaded configuration.
///
/// Cloning is cheap; all clones share one tree, one autosave timer and one
/// watcher. Reads and writes never touch the disk: writes schedule a
/// debounced save on the background runtime.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    path: PathBuf,
    test_mode: bool,
    persistence: Arc<dyn Persistence>,
    debug_detector: Option<DebugDetector>,
    tree: RwLock<Node>,
    type_hints: RwLock<BTreeMap<String, String>>,
    first_start: OnceLock<DateTime<Local>>,
    state: Mutex<ManagerState>,
    loaded: AtomicBool,
    closed: AtomicBool,
    scheduler: AutosaveScheduler,
    watcher: ChangeWatcher,
    watch_enabled: bool,
    save_lock: Mutex<()>,
    last_backup: Mutex<Option<PathBuf>>,
    events: broadcast::Sender<ReloadEvent>,
    self_ref: Weak<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Parses RFC 3339 or a naive ISO-8601 timestamp in local time.
fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Local));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

impl Manager {
    /// Resolves the path, loads the file and starts watching it.
    ///
    /// A file that exists but cannot be loaded fails construction and is left
    /// untouched. A missing file is created empty when `auto_create` is set.
    pub fn open(options: ManagerOptions) -> Result<Self, StoreError> {
        let ManagerOptions {
            path,
            settings,
            persistence,
            debug_detector,
            background,
        } = options;

        let resolved = paths::resolve_config_path(path.as_deref())?;
        let path = if settings.test_mode {
            paths::prepare_test_config(&resolved)?
        } else {
            resolved
        };

        let (document, created) = match persistence.load(&path) {
            Ok(document) => (document, false),
            Err(StoreError::NotFound { .. }) if settings.auto_create => {
                info!(path = %path.display(), "Config file not found, creating an empty one");
                (Document::default(), true)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load config, leaving the file untouched");
                return Err(e);
            }
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let root: Weak<dyn Root> = weak.clone();
            let mut data = document.data;
            data.attach(RootRef::new(root));

            Shared {
                path,
                test_mode: settings.test_mode,
                persistence,
                debug_detector,
                tree: RwLock::new(data),
                type_hints: RwLock::new(document.type_hints),
                first_start: OnceLock::new(),
                state: Mutex::new(ManagerState::Loading),
                loaded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                scheduler: AutosaveScheduler::new(settings.autosave_delay(), background.clone()),
                watcher: ChangeWatcher::new(settings.watcher(), background),
                watch_enabled: settings.watch,
                save_lock: Mutex::new(()),
                last_backup: Mutex::new(None),
                events,
                self_ref: weak.clone(),
            }
        });

        shared.enter_ready(created)?;
        exit::register(&shared);
        info!(path = %shared.path.display(), test_mode = shared.test_mode, "Config ready");
        Ok(Manager { shared })
    }

    /// Whether two handles refer to the same manager.
    pub fn ptr_eq(a: &Manager, b: &Manager) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Absolute path of the backing file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Whether this manager works on a test copy.
    pub fn is_test_mode(&self) -> bool {
        self.shared.test_mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *lock(&self.shared.state)
    }

    /// Whether loading finished and saves are allowed.
    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::SeqCst)
    }

    /// Whether [`Manager::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// State of the external change watcher.
    pub fn watch_state(&self) -> WatchState {
        self.shared.watcher.state()
    }

    /// Whether an autosave is waiting for its delay to pass.
    pub fn autosave_pending(&self) -> bool {
        self.shared.scheduler.is_pending()
    }

    /// Value at a dotted path, or `None` when any segment is missing.
    pub fn get(&self, path: &str) -> Option<Value> {
        read(&self.shared.tree).get(path)
    }

    /// Value at `path` converted to `T`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        read(&self.shared.tree).get_as(path)
    }

    /// Value at `path` converted to `T`, or `default`.
    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        read(&self.shared.tree).get_or(path, default)
    }

    /// String value at `path` as a filesystem path.
    pub fn get_path(&self, path: &str) -> Option<PathBuf> {
        self.get(path)
            .and_then(|value| value.as_str().map(PathBuf::from))
    }

    /// Whether `path` holds a value.
    pub fn contains(&self, path: &str) -> bool {
        read(&self.shared.tree).contains(path)
    }

    /// Attribute-style read of a top-level key; a missing key is an error.
    pub fn field(&self, key: &str) -> Result<Value, StoreError> {
        read(&self.shared.tree).field(key)
    }

    /// Sets the value at a dotted `path` and schedules an autosave.
    pub fn set(&self, path: &str, value: impl Into<Value>) {
        write(&self.shared.tree).set(path, value);
    }

    /// Sets a direct child of the root and schedules an autosave.
    pub fn set_field(&self, key: &str, value: impl Into<Value>) {
        write(&self.shared.tree).set_field(key, value);
    }

    /// Removes the value at `path`, scheduling an autosave if it existed.
    pub fn remove(&self, path: &str) -> Option<Value> {
        write(&self.shared.tree).remove(path)
    }

    /// Applies several writes and schedules a single autosave.
    pub fn update<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut stored = false;
        {
            let mut tree = write(&self.shared.tree);
            for (path, value) in entries {
                stored |= tree.store(path.as_ref(), value.into());
            }
        }
        if stored {
            self.shared.schedule_autosave();
        }
    }

    /// Read access to the whole tree.
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        read(&self.shared.tree)
    }

    /// Runs `f` with mutable access to the tree.
    ///
    /// Anything `f` inserts is re-tagged with this manager afterwards, so
    /// later nested writes still autosave.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        let mut tree = write(&self.shared.tree);
        let result = f(&mut tree);
        tree.attach(self.shared.root_ref());
        result
    }

    /// Plain nested mapping of the data, without reserved keys.
    pub fn to_mapping(&self) -> serde_yaml::Mapping {
        read(&self.shared.tree).to_mapping()
    }

    /// Evaluates the debug detector; false when none is configured.
    pub fn debug_mode(&self) -> bool {
        self.shared.debug_mode()
    }

    /// Records a type hint for `path`.
    pub fn set_type_hint(&self, path: &str, hint: impl Into<String>) {
        write(&self.shared.type_hints).insert(path.to_string(), hint.into());
        self.shared.schedule_autosave();
    }

    /// The type hint recorded for `path`.
    pub fn type_hint(&self, path: &str) -> Option<String> {
        read(&self.shared.type_hints).get(path).cloned()
    }

    /// Every recorded type hint.
    pub fn type_hints(&self) -> BTreeMap<String, String> {
        read(&self.shared.type_hints).clone()
    }

    /// When this configuration was first started, preserved across restarts.
    pub fn first_start_time(&self) -> DateTime<Local> {
        self.shared.first_start_time()
    }

    /// Where every save writes its backup copy.
    pub fn backup_path(&self) -> PathBuf {
        self.shared.backup_path()
    }

    /// Backup written by the most recent successful save.
    pub fn last_backup_path(&self) -> Option<PathBuf> {
        lock(&self.shared.last_backup).clone()
    }

    /// Existing backups of this configuration, newest first.
    pub fn list_backups(&self) -> Vec<PathBuf> {
        paths::list_backups(&self.shared.path)
    }

    /// Receives an event for every external reload attempt.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.shared.events.subscribe()
    }

    /// Writes the current tree to disk now.
    pub fn save(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed {
                path: self.shared.path.clone(),
            });
        }
        self.shared.save()
    }

    /// Replaces the in-memory tree with the file's content.
    ///
    /// On failure the current tree is kept.
    pub fn reload(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed {
                path: self.shared.path.clone(),
            });
        }
        self.shared.reload()
    }

    /// Copy of the data and type hints.
    pub fn snapshot(&self) -> Document {
        self.shared.document()
    }

    /// Replaces data and type hints with `snapshot` and saves immediately.
    pub fn restore(&self, snapshot: Document) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed {
                path: self.shared.path.clone(),
            });
        }
        let Document { mut data, type_hints } = snapshot;
        data.attach(self.shared.root_ref());
        *write(&self.shared.tree) = data;
        *write(&self.shared.type_hints) = type_hints;
        self.shared.save()
    }

    /// Applies `changes` until the returned guard is dropped.
    pub fn temporary<I, K, V>(&self, changes: I) -> TemporaryGuard
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let snapshot = self.snapshot();
        self.update(changes);
        TemporaryGuard {
            manager: self.clone(),
            snapshot: Some(snapshot),
        }
    }

    /// Stops the watcher, cancels the pending autosave and performs a final
    /// save if the config was ever loaded. Later calls do nothing.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("path", &self.shared.path)
            .field("test_mode", &self.shared.test_mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Restores the snapshot taken by [`Manager::temporary`] when dropped.
pub struct TemporaryGuard {
    manager: Manager,
    snapshot: Option<Document>,
}

impl TemporaryGuard {
    /// The manager the changes apply to.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }
}

impl Drop for TemporaryGuard {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(e) = self.manager.restore(snapshot) {
                warn!(error = %e, "Failed to restore config after temporary changes");
            }
        }
    }
}

impl Shared {
    fn root_ref(&self) -> RootRef {
        let root: Weak<dyn Root> = self.self_ref.clone();
        RootRef::new(root)
    }

    fn set_state(&self, state: ManagerState) {
        *lock(&self.state) = state;
    }

    fn first_start_time(&self) -> DateTime<Local> {
        self.first_start.get().copied().unwrap_or_else(Local::now)
    }

    fn backup_path(&self) -> PathBuf {
        paths::backup_path(&self.path, &self.first_start_time().naive_local())
    }

    /// Derives the first start time and stores derived fields. Returns
    /// whether the tree or hints changed.
    fn apply_derived(&self) -> bool {
        let mut changed = false;
        {
            let mut tree = write(&self.tree);

            let path = self.path.to_string_lossy().replace('\\', "/");
            if tree.get_ref(CONFIG_FILE_PATH_KEY).and_then(Value::as_str) != Some(path.as_str()) {
                tree.store(CONFIG_FILE_PATH_KEY, Value::from(path));
                changed = true;
            }

            let stored = tree
                .get_ref(FIRST_START_TIME_KEY)
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            let first_start = *self.first_start.get_or_init(|| stored.unwrap_or_else(Local::now));
            if stored.is_none() {
                tree.store(FIRST_START_TIME_KEY, Value::from(first_start.to_rfc3339()));
                changed = true;
            }
        }

        let mut hints = write(&self.type_hints);
        if hints.get(FIRST_START_TIME_KEY).map(String::as_str) != Some(DATETIME_HINT) {
            hints.insert(FIRST_START_TIME_KEY.to_string(), DATETIME_HINT.to_string());
            changed = true;
        }
        changed
    }

    fn enter_ready(&self, created: bool) -> Result<(), StoreError> {
        let changed = self.apply_derived();
        self.loaded.store(true, Ordering::SeqCst);
        self.set_state(ManagerState::Ready);

        if created || changed {
            debug!(path = %self.path.display(), created, "Writing initial config");
            match self.save() {
                Ok(()) => {}
                Err(e) if created => return Err(e),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Initial config write failed");
                }
            }
        }

        if self.watch_enabled {
            let weak = self.self_ref.clone();
            let on_change: ChangeCallback = Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_external_change();
                }
            });
            if let Err(e) = self.watcher.start(&self.path, on_change) {
                warn!(path = %self.path.display(), error = %e, "Config watcher not started");
            }
        }
        Ok(())
    }

    fn document(&self) -> Document {
        let data = read(&self.tree).clone();
        let type_hints = read(&self.type_hints).clone();
        Document::new(data, type_hints)
    }

    fn save(&self) -> Result<(), StoreError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(StoreError::NotLoaded {
                path: self.path.clone(),
            });
        }

        let _guard = lock(&self.save_lock);
        let document = self.document();

        self.watcher.mark_internal_save(true);
        if let Err(e) = self.persistence.save(&self.path, &document) {
            self.watcher.mark_internal_save(false);
            return Err(e);
        }
        debug!(path = %self.path.display(), "Config saved");

        let backup = self.backup_path();
        match self.persistence.save(&backup, &document) {
            Ok(()) => *lock(&self.last_backup) = Some(backup),
            Err(e) => warn!(path = %backup.display(), error = %e, "Backup failed, primary config was saved"),
        }
        Ok(())
    }

    fn reload(&self) -> Result<(), StoreError> {
        let Document { mut data, type_hints } = self.persistence.load(&self.path)?;
        data.attach(self.root_ref());
        *write(&self.tree) = data;
        *write(&self.type_hints) = type_hints;
        self.apply_derived();
        info!(path = %self.path.display(), "Config reloaded");
        Ok(())
    }

    fn on_external_change(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(ManagerState::Reloading);
        let event = match self.reload() {
            Ok(()) => ReloadEvent::Reloaded,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Reload after external change failed");
                ReloadEvent::ReloadFailed {
                    message: e.to_string(),
                }
            }
        };
        if !self.closed.load(Ordering::SeqCst) {
            self.set_state(ManagerState::Ready);
        }
        let _ = self.events.send(event);
    }

    /// Stops background work and flushes once.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watcher.stop();
        self.scheduler.cleanup();

        if self.loaded.load(Ordering::SeqCst) {
            if let Err(e) = self.save() {
                warn!(path = %self.path.display(), error = %e, "Final save failed");
            }
        }
        self.set_state(ManagerState::Closed);
        info!(path = %self.path.display(), "Config closed");
    }
}

impl Root for Shared {
    fn schedule_autosave(&self) {
        if !self.loaded.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let weak = self.self_ref.clone();
        self.scheduler.schedule(move || match weak.upgrade() {
            Some(shared) => shared.save(),
            None => Ok(()),
        });
    }

    fn debug_mode(&self) -> bool {
        self.debug_detector.as_ref().map_or(false, |detect| detect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::MockPersistence;
    use crate::runtime::Background;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> ManagerOptions {
        ManagerOptions::new()
            .path(dir.path().join("config.yaml"))
            .autosave_delay(Duration::from_millis(20))
            .watch(false)
            .background(Arc::new(Background::new("manager-test")))
    }

    #[test]
    fn parses_stored_timestamps() {
        assert!(parse_timestamp("2024-03-05T07:08:09+02:00").is_some());
        assert!(parse_timestamp("2024-03-05T07:08:09.123456").is_some());
        assert!(parse_timestamp("2024-03-05 07:08:09").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn new_file_gets_derived_fields() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();

        assert!(manager.path().exists());
        assert_eq!(manager.state(), ManagerState::Ready);
        assert_eq!(
            manager.get_path(CONFIG_FILE_PATH_KEY),
            Some(PathBuf::from(manager.path().to_string_lossy().replace('\\', "/")))
        );
        assert_eq!(manager.type_hint(FIRST_START_TIME_KEY).as_deref(), Some(DATETIME_HINT));
        assert!(manager.last_backup_path().is_some_and(|p| p.exists()));
        manager.close();
    }

    #[test]
    fn first_start_time_survives_restarts() {
        let dir = TempDir::new().unwrap();
        let first = Manager::open(options(&dir)).unwrap();
        let started = first.first_start_time();
        first.close();

        let second = Manager::open(options(&dir)).unwrap();
        assert_eq!(second.first_start_time().timestamp(), started.timestamp());
        second.close();
    }

    #[test]
    fn missing_file_without_auto_create_fails() {
        let dir = TempDir::new().unwrap();
        let err = Manager::open(options(&dir).auto_create(false)).unwrap_err();

        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!dir.path().join("config.yaml").exists());
    }

    #[test]
    fn attribute_reads_report_missing_fields() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();
        manager.set_field("port", 8080);

        assert_eq!(manager.field("port").unwrap(), Value::Int(8080));
        let err = manager.field("prot").unwrap_err();
        assert!(err.to_string().contains("did you mean 'port'"));
        manager.close();
    }

    #[test]
    fn debug_mode_is_derived_on_every_read() {
        let dir = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let manager = Manager::open(options(&dir).debug_detector(move || f.load(Ordering::SeqCst))).unwrap();

        assert!(!manager.debug_mode());
        flag.store(true, Ordering::SeqCst);
        assert_eq!(manager.get("debug_mode"), Some(Value::Bool(true)));
        assert_eq!(manager.field("debug_mode").unwrap(), Value::Bool(true));

        manager.set("debug_mode", false);
        manager.set("nested.debug_mode", false);
        assert!(manager.debug_mode());
        assert!(!manager.contains("nested"));
        manager.close();
    }

    #[test]
    fn missing_detector_means_not_debugging() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();
        assert!(!manager.debug_mode());
        assert_eq!(manager.field("debug_mode").unwrap(), Value::Bool(false));
        manager.close();
    }

    #[test]
    fn nested_writes_through_edit_still_autosave() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();

        manager.edit(|tree| {
            let mut server = Node::new();
            server.set("port", 1);
            tree.set_field("server", server);
        });
        std::thread::sleep(Duration::from_millis(200));

        assert!(manager.read().node("server").unwrap().root().is_attached());
        manager.edit(|tree| tree.node_mut("server").unwrap().set("port", 2));
        std::thread::sleep(Duration::from_millis(200));

        let on_disk = YamlFile.load(manager.path()).unwrap();
        assert_eq!(on_disk.data.get("server.port"), Some(Value::Int(2)));
        manager.close();
    }

    #[test]
    fn temporary_changes_are_rolled_back() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();
        manager.set("mode", "normal");

        {
            let _guard = manager.temporary([("mode", "maintenance"), ("extra.flag", "on")]);
            assert_eq!(manager.get_as::<String>("mode").as_deref(), Some("maintenance"));
        }

        assert_eq!(manager.get_as::<String>("mode").as_deref(), Some("normal"));
        assert!(!manager.contains("extra"));
        manager.close();
    }

    #[test]
    fn restore_replaces_data_and_hints() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();
        manager.set("a", 1);
        let snapshot = manager.snapshot();

        manager.set("a", 2);
        manager.set_type_hint("a", "int");
        manager.restore(snapshot).unwrap();

        assert_eq!(manager.get("a"), Some(Value::Int(1)));
        assert_eq!(manager.type_hint("a"), None);
        assert_eq!(YamlFile.load(manager.path()).unwrap().data.get("a"), Some(Value::Int(1)));
        manager.close();
    }

    #[test]
    fn closed_manager_rejects_explicit_io() {
        let dir = TempDir::new().unwrap();
        let manager = Manager::open(options(&dir)).unwrap();
        manager.close();

        assert!(matches!(manager.save(), Err(StoreError::Closed { .. })));
        assert!(matches!(manager.reload(), Err(StoreError::Closed { .. })));
        assert_eq!(manager.state(), ManagerState::Closed);
    }

    #[test]
    fn explicit_save_surfaces_write_errors() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockPersistence::new();
        mock.expect_load().returning(|_| {
            let mut data = Node::new();
            data.set(CONFIG_FILE_PATH_KEY, "elsewhere");
            Ok(Document::new(data, BTreeMap::new()))
        });
        let mut saves = 0;
        mock.expect_save().returning(move |path, _| {
            saves += 1;
            if saves == 1 {
                Ok(())
            } else {
                Err(StoreError::WriteFailed {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                })
            }
        });

        let manager = Manager::open(options(&dir).persistence(Arc::new(mock))).unwrap();
        assert!(matches!(manager.save(), Err(StoreError::WriteFailed { .. })));

        // Autosave failures stay in the background.
        manager.set("a", 1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(manager.get("a"), Some(Value::Int(1)));
    }

    fn read_only(path: &Path) -> StoreError {
        StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        }
    }

    #[test]
    fn existing_config_opens_when_it_cannot_be_written() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockPersistence::new();
        mock.expect_load().returning(|_| {
            let mut data = Node::new();
            data.set("server.port", 8080);
            Ok(Document::new(data, BTreeMap::new()))
        });
        mock.expect_save().returning(|path, _| Err(read_only(path)));

        let manager = Manager::open(options(&dir).persistence(Arc::new(mock))).unwrap();

        assert_eq!(manager.state(), ManagerState::Ready);
        assert_eq!(manager.get("server.port"), Some(Value::Int(8080)));
        assert!(manager.contains(CONFIG_FILE_PATH_KEY));
        assert!(matches!(manager.save(), Err(StoreError::WriteFailed { .. })));
    }

    #[test]
    fn new_config_fails_when_it_cannot_be_written() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockPersistence::new();
        mock.expect_load()
            .returning(|path| Err(StoreError::NotFound { path: path.to_path_buf() }));
        mock.expect_save().returning(|path, _| Err(read_only(path)));

        let err = Manager::open(options(&dir).persistence(Arc::new(mock))).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { .. }));
    }

    #[test]
    fn backup_failure_does_not_fail_the_save() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.yaml");
        let mut mock = MockPersistence::new();
        mock.expect_load()
            .returning(|path| Err(StoreError::NotFound { path: path.to_path_buf() }));
        let primary = config.clone();
        mock.expect_save().returning(move |path, _| {
            if path == primary {
                Ok(())
            } else {
                Err(StoreError::SerializeFailed("backup disk full".into()))
            }
        });

        let manager = Manager::open(options(&dir).persistence(Arc::new(mock))).unwrap();
        assert!(manager.save().is_ok());
        assert_eq!(manager.last_backup_path(), None);
    }
}
