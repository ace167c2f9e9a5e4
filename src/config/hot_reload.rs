//! External change detection for the backing file.
//!
//! The watcher polls the file's modification time. A change that follows a
//! recent [`ChangeWatcher::mark_internal_save`] is the manager's own write and
//! is swallowed; anything else invokes the reload callback.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::SpawnError;
use crate::runtime::Background;

/// Callback invoked for every external change.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Timing knobs for [`ChangeWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Delay between two modification-time checks.
    pub poll_interval: Duration,
    /// How long after a save mark a change still counts as self-inflicted.
    pub grace_window: Duration,
    /// Upper bound on how long [`ChangeWatcher::stop`] waits for the poll loop.
    pub stop_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            grace_window: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Watching,
}

/// Outcome of comparing an observed modification time with the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unchanged,
    SelfInflicted,
    External,
    /// A save was marked but the change arrived after the grace window.
    ExternalStaleMark,
}

impl Verdict {
    /// Whether the change should trigger a reload.
    pub fn is_external(self) -> bool {
        matches!(self, Verdict::External | Verdict::ExternalStaleMark)
    }
}

#[derive(Debug, Default)]
struct Tracker {
    last_mtime: Option<SystemTime>,
    internal_save_at: Option<Instant>,
}

impl Tracker {
    fn reconcile(&mut self, observed: Option<SystemTime>, now: Instant, grace: Duration) -> Verdict {
        let Some(observed) = observed else {
            return Verdict::Unchanged;
        };
        if self.last_mtime.is_some_and(|last| observed <= last) {
            return Verdict::Unchanged;
        }

        self.last_mtime = Some(observed);
        match self.internal_save_at.take() {
            Some(marked) if now.saturating_duration_since(marked) <= grace => Verdict::SelfInflicted,
            Some(_) => Verdict::ExternalStaleMark,
            None => Verdict::External,
        }
    }
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    done_rx: std_mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Polls a file and reports modifications the owner did not make itself.
pub struct ChangeWatcher {
    settings: WatcherSettings,
    background: Arc<Background>,
    tracker: Arc<Mutex<Tracker>>,
    worker: Mutex<Option<Worker>>,
}

impl ChangeWatcher {
    /// A stopped watcher that will poll on `background`.
    pub fn new(settings: WatcherSettings, background: Arc<Background>) -> Self {
        Self {
            settings,
            background,
            tracker: Arc::new(Mutex::new(Tracker::default())),
            worker: Mutex::new(None),
        }
    }

    /// The polling settings.
    pub fn settings(&self) -> WatcherSettings {
        self.settings
    }

    /// Whether a worker is running.
    pub fn state(&self) -> WatchState {
        if lock(&self.worker).is_some() {
            WatchState::Watching
        } else {
            WatchState::Stopped
        }
    }

    /// Records the current modification time of `path` and starts polling it.
    ///
    /// A watcher that is already running is stopped first.
    pub fn start(&self, path: &Path, on_change: ChangeCallback) -> Result<(), SpawnError> {
        self.stop();

        {
            let mut tracker = lock(&self.tracker);
            tracker.last_mtime = modified(path);
            tracker.internal_save_at = None;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = std_mpsc::channel();
        let handle = self.background.spawn(poll_loop(
            path.to_path_buf(),
            self.settings,
            self.tracker.clone(),
            on_change,
            stop_rx,
            done_tx,
        ))?;

        *lock(&self.worker) = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        info!(path = %path.display(), interval_ms = self.settings.poll_interval.as_millis() as u64, "Watching config file");
        Ok(())
    }

    /// Marks (or clears) an imminent write by the owner of the file.
    pub fn mark_internal_save(&self, active: bool) {
        lock(&self.tracker).internal_save_at = active.then(Instant::now);
    }

    /// Signals the poll loop to exit and waits at most `stop_timeout` for it.
    ///
    /// A loop that does not finish in time is aborted. Calling this on a
    /// stopped watcher does nothing.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };

        let _ = worker.stop_tx.send(true);
        match worker.done_rx.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => debug!("Config watcher stopped"),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                    "Config watcher did not stop in time, aborting"
                );
                worker.handle.abort();
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.stop_tx.send(true);
            worker.handle.abort();
        }
    }
}

async fn poll_loop(
    path: PathBuf,
    settings: WatcherSettings,
    tracker: Arc<Mutex<Tracker>>,
    on_change: ChangeCallback,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: std_mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }

        let observed = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Could not stat config file");
                None
            }
        };

        let verdict = lock(&tracker).reconcile(observed, Instant::now(), settings.grace_window);
        match verdict {
            Verdict::Unchanged => {}
            Verdict::SelfInflicted => debug!(path = %path.display(), "Ignoring change from own save"),
            Verdict::External | Verdict::ExternalStaleMark => {
                if verdict == Verdict::ExternalStaleMark {
                    debug!(path = %path.display(), "Save mark expired, treating change as external");
                }
                info!(path = %path.display(), "Config file changed externally");
                let callback = on_change.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
                    error!(error = %e, "Config change callback panicked");
                }
            }
        }
    }

    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;
    use tempfile::TempDir;

    const GRACE: Duration = Duration::from_secs(2);

    fn fast_settings() -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(20),
            grace_window: GRACE,
            stop_timeout: Duration::from_millis(1500),
        }
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
    }

    fn counting_callback() -> (Arc<AtomicUsize>, ChangeCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn reconcile_ignores_unchanged_and_missing_files() {
        let t0 = SystemTime::now();
        let mut tracker = Tracker {
            last_mtime: Some(t0),
            internal_save_at: None,
        };

        assert_eq!(tracker.reconcile(Some(t0), Instant::now(), GRACE), Verdict::Unchanged);
        assert_eq!(tracker.reconcile(None, Instant::now(), GRACE), Verdict::Unchanged);
        assert_eq!(
            tracker.reconcile(Some(t0 - Duration::from_secs(1)), Instant::now(), GRACE),
            Verdict::Unchanged
        );
    }

    #[test]
    fn reconcile_classifies_advances() {
        let t0 = SystemTime::now();
        let now = Instant::now();
        let mut tracker = Tracker {
            last_mtime: Some(t0),
            internal_save_at: Some(now),
        };

        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(tracker.reconcile(Some(t1), now + Duration::from_millis(500), GRACE), Verdict::SelfInflicted);
        assert_eq!(tracker.internal_save_at, None);
        assert_eq!(tracker.last_mtime, Some(t1));

        let t2 = t1 + Duration::from_secs(1);
        assert_eq!(tracker.reconcile(Some(t2), now, GRACE), Verdict::External);

        tracker.internal_save_at = Some(now);
        let t3 = t2 + Duration::from_secs(1);
        let verdict = tracker.reconcile(Some(t3), now + Duration::from_secs(3), GRACE);
        assert_eq!(verdict, Verdict::ExternalStaleMark);
        assert!(verdict.is_external());
        assert_eq!(tracker.internal_save_at, None);
    }

    #[test]
    fn first_observation_counts_as_a_change() {
        let mut tracker = Tracker::default();
        assert_eq!(
            tracker.reconcile(Some(SystemTime::now()), Instant::now(), GRACE),
            Verdict::External
        );
    }

    #[test]
    fn external_modification_invokes_callback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "a: 1\n").unwrap();

        let watcher = ChangeWatcher::new(fast_settings(), Arc::new(Background::new("watch-test")));
        let (count, callback) = counting_callback();
        watcher.start(&path, callback).unwrap();
        assert_eq!(watcher.state(), WatchState::Watching);

        fs::write(&path, "a: 2\n").unwrap();
        bump_mtime(&path, 5);
        sleep(Duration::from_millis(300));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn marked_save_is_not_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "a: 1\n").unwrap();

        let watcher = ChangeWatcher::new(fast_settings(), Arc::new(Background::new("watch-test")));
        let (count, callback) = counting_callback();
        watcher.start(&path, callback).unwrap();

        watcher.mark_internal_save(true);
        fs::write(&path, "a: 2\n").unwrap();
        bump_mtime(&path, 5);
        sleep(Duration::from_millis(300));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        watcher.stop();
    }

    #[test]
    fn stop_is_bounded_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "").unwrap();

        let settings = WatcherSettings {
            poll_interval: Duration::from_secs(30),
            ..fast_settings()
        };
        let watcher = ChangeWatcher::new(settings, Arc::new(Background::new("watch-test")));
        let (_count, callback) = counting_callback();
        watcher.start(&path, callback).unwrap();

        let started = Instant::now();
        watcher.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(watcher.state(), WatchState::Stopped);

        watcher.stop();
        assert_eq!(watcher.state(), WatchState::Stopped);
    }

    #[test]
    fn start_fails_on_torn_down_runtime() {
        let background = Arc::new(Background::new("watch-test"));
        background.shutdown();
        let watcher = ChangeWatcher::new(fast_settings(), background);
        let (_count, callback) = counting_callback();

        let err = watcher.start(Path::new("/nonexistent"), callback).unwrap_err();
        assert!(err.is_teardown());
        assert_eq!(watcher.state(), WatchState::Stopped);
    }
}
