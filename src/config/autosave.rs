//! Debounced autosave scheduling.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::runtime::Background;

/// Debounces save requests behind a single cancellable timer.
///
/// Every call to [`AutosaveScheduler::schedule`] replaces the pending timer,
/// so a burst of writes inside `delay` produces exactly one save.
pub struct AutosaveScheduler {
    delay: Duration,
    background: Arc<Background>,
    state: Arc<Mutex<SchedulerState>>,
}

#[derive(Default)]
struct SchedulerState {
    /// Timer task that has not fired yet.
    pending: Option<JoinHandle<()>>,
    /// Bumped on every schedule; a timer only fires if it is still current.
    generation: u64,
    /// Set by cleanup or when the runtime is being torn down. Permanent.
    disabled: bool,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AutosaveScheduler {
    /// A scheduler with no timer pending.
    pub fn new(delay: Duration, background: Arc<Background>) -> Self {
        Self {
            delay,
            background,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// The debounce delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancels any pending timer and starts a new one that runs `callback` once.
    ///
    /// Never blocks and never fails: callback errors are logged, and a runtime
    /// that is being torn down disables the scheduler for good.
    pub fn schedule<F, E>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.disabled {
            trace!("Autosave disabled, ignoring schedule request");
            return;
        }

        if let Some(previous) = state.pending.take() {
            previous.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let shared = Arc::downgrade(&self.state);
        let delay = self.delay;
        let timer = async move {
            tokio::time::sleep(delay).await;

            {
                let Some(shared) = shared.upgrade() else { return };
                let mut state = lock(&shared);
                if state.disabled || state.generation != generation {
                    return;
                }
                state.pending = None;
            }

            match tokio::task::spawn_blocking(callback).await {
                Ok(Ok(())) => debug!("Autosave completed"),
                Ok(Err(e)) => warn!(error = %e, "Autosave failed"),
                Err(e) => error!(error = %e, "Autosave task panicked"),
            }
        };

        match self.background.spawn(timer) {
            Ok(handle) => state.pending = Some(handle),
            Err(e) if e.is_teardown() => {
                state.disabled = true;
                debug!("Background runtime is shutting down, autosave disabled");
            }
            Err(e) => warn!(error = %e, "Failed to schedule autosave"),
        }
    }

    /// Cancels any pending timer and permanently disables scheduling. Idempotent.
    pub fn cleanup(&self) {
        let mut state = lock(&self.state);
        state.disabled = true;
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
            debug!("Cancelled pending autosave");
        }
    }

    /// Whether a timer is waiting to fire.
    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Whether a teardown turned scheduling off for good.
    pub fn is_disabled(&self) -> bool {
        lock(&self.state).disabled
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.state).pending.take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    fn scheduler(delay_ms: u64) -> (Arc<Background>, AutosaveScheduler) {
        let background = Arc::new(Background::new("autosave-test"));
        let scheduler = AutosaveScheduler::new(Duration::from_millis(delay_ms), background.clone());
        (background, scheduler)
    }

    #[test]
    fn rapid_schedules_collapse_into_one_call() {
        let (_bg, scheduler) = scheduler(50);
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));

        for i in 0..10 {
            let calls = calls.clone();
            let last = last.clone();
            scheduler.schedule(move || -> Result<(), String> {
                calls.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = Some(i);
                Ok(())
            });
        }
        assert!(scheduler.is_pending());

        sleep(Duration::from_millis(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), Some(9));
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn separate_bursts_each_fire() {
        let (_bg, scheduler) = scheduler(20);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            scheduler.schedule(move || -> Result<(), String> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            sleep(Duration::from_millis(250));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cleanup_cancels_and_is_idempotent() {
        let (_bg, scheduler) = scheduler(50);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        scheduler.schedule(move || -> Result<(), String> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        scheduler.cleanup();
        scheduler.cleanup();

        let c = calls.clone();
        scheduler.schedule(move || -> Result<(), String> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sleep(Duration::from_millis(250));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_disabled());
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn failing_callback_is_contained() {
        let (_bg, scheduler) = scheduler(10);
        scheduler.schedule(|| Err::<(), _>("disk full"));
        sleep(Duration::from_millis(200));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        scheduler.schedule(move || -> Result<(), String> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn torn_down_runtime_disables_scheduling() {
        let (background, scheduler) = scheduler(10);
        background.shutdown();

        scheduler.schedule(|| Ok::<(), String>(()));
        assert!(scheduler.is_disabled());
        assert!(!scheduler.is_pending());
    }
}
