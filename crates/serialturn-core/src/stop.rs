//! Cooperative stop signal shared by the session and its loops

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    set: Mutex<bool>,
    changed: Condvar,
}

/// One-shot stop flag.
///
/// Cleared when a session starts, set once by a stop request, and observed by
/// both loops at their next iteration boundary. Sleeping through
/// [`StopSignal::wait_timeout`] wakes up as soon as the signal is raised.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    /// Create a cleared signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` for the call that actually raised it.
    pub fn set(&self) -> bool {
        let mut set = self.inner.set.lock().unwrap_or_else(PoisonError::into_inner);
        let first = !*set;
        *set = true;
        self.inner.changed.notify_all();
        first
    }

    /// Clear the signal before a new start
    pub fn clear(&self) {
        *self.inner.set.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Whether a stop has been requested
    pub fn is_set(&self) -> bool {
        *self.inner.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, returning early with `true` if the signal is raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.inner.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            set = self
                .inner
                .changed
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *set
    }

    /// Block until the signal is raised
    pub fn wait(&self) {
        let mut set = self.inner.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            set = self
                .inner
                .changed
                .wait(set)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal").field("set", &self.is_set()).finish()
    }
}
