//! Background runtime shared by autosave timers and file watchers.
//!
//! The runtime is owned by the store rather than borrowed from the caller, so
//! managers work the same from synchronous code and from inside any async
//! runtime. It is built on first use and can be torn down exactly once.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SpawnError;

const WORKER_THREADS: usize = 2;

enum RuntimeState {
    Idle,
    Running(Runtime),
    TornDown,
}

/// Lazily-built multi-threaded runtime for background work.
pub struct Background {
    name: String,
    state: Mutex<RuntimeState>,
}

impl Background {
    /// Creates a runtime handle; no threads start until the first spawn.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RuntimeState::Idle),
        }
    }

    /// The process-wide runtime used unless a manager is given its own.
    pub fn global() -> Arc<Background> {
        static GLOBAL: OnceLock<Arc<Background>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Background::new("config-store-bg")))
            .clone()
    }

    /// Spawns `future`, building the runtime if needed.
    ///
    /// Fails with [`SpawnError::TearingDown`] once [`Background::shutdown`] ran.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let RuntimeState::Idle = *state {
            let runtime = Builder::new_multi_thread()
                .worker_threads(WORKER_THREADS)
                .thread_name(self.name.clone())
                .enable_all()
                .build()
                .map_err(SpawnError::Build)?;
            debug!(name = %self.name, "Started background runtime");
            *state = RuntimeState::Running(runtime);
        }

        match &*state {
            RuntimeState::Running(runtime) => Ok(runtime.spawn(future)),
            RuntimeState::Idle | RuntimeState::TornDown => Err(SpawnError::TearingDown),
        }
    }

    /// Stops the runtime without waiting for in-flight tasks. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let RuntimeState::Running(runtime) = std::mem::replace(&mut *state, RuntimeState::TornDown) {
            runtime.shutdown_background();
            debug!(name = %self.name, "Background runtime shut down");
        }
    }

    /// Whether [`Background::shutdown`] has run.
    pub fn is_torn_down(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            RuntimeState::TornDown
        )
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.shutdown();
    }
}
