//! Flush-and-stop of live managers at process exit.
//!
//! Managers register a weak handle when they become ready. The roster is
//! drained once, either explicitly through [`flush_all`] or by a `libc::atexit`
//! handler installed on first registration. The exit handler also tears down
//! the global background runtime, so timers scheduled after the flush are
//! refused with [`SpawnError::TearingDown`](crate::SpawnError::TearingDown).

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Once, PoisonError, Weak};

use tracing::{debug, warn};

use super::Shared;
use crate::runtime::Background;

static ROSTER: Mutex<Vec<Weak<Shared>>> = Mutex::new(Vec::new());
static INSTALL: Once = Once::new();

extern "C" fn flush_at_exit() {
    // Unwinding out of an extern "C" function aborts the process.
    let _ = panic::catch_unwind(|| flush_and_stop(&Background::global()));
}

/// Adds `shared` to the exit roster, installing the exit handler once.
pub(crate) fn register(shared: &Arc<Shared>) {
    INSTALL.call_once(|| {
        // SAFETY: `flush_at_exit` is a plain function with no captured state
        // and never unwinds.
        let rc = unsafe { libc::atexit(flush_at_exit) };
        if rc != 0 {
            warn!(rc, "Could not install exit handler, configs will not be flushed at exit");
        }
    });

    let mut roster = ROSTER.lock().unwrap_or_else(PoisonError::into_inner);
    roster.retain(|entry| entry.strong_count() > 0);
    roster.push(Arc::downgrade(shared));
}

/// Number of registered managers that are still alive.
pub fn live_count() -> usize {
    ROSTER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|entry| entry.strong_count() > 0)
        .count()
}

/// Closes every registered manager that is still alive and empties the roster.
///
/// Each close is isolated: a panic in one does not keep the others from
/// being flushed. Returns how many managers were closed.
pub fn flush_all() -> usize {
    let entries = std::mem::take(&mut *ROSTER.lock().unwrap_or_else(PoisonError::into_inner));

    let mut closed = 0;
    for shared in entries.iter().filter_map(Weak::upgrade) {
        match panic::catch_unwind(AssertUnwindSafe(|| shared.close())) {
            Ok(()) => closed += 1,
            Err(_) => warn!(path = %shared.path.display(), "Panic while closing config"),
        }
    }
    if closed > 0 {
        debug!(closed, "Flushed live configs");
    }
    closed
}

/// Flushes every live manager, then shuts down `background`.
pub fn flush_and_stop(background: &Background) -> usize {
    let closed = flush_all();
    background.shutdown();
    closed
}
