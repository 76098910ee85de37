// ============================================================================
// Restore Guards
// ============================================================================
//
// Every filter, parameter, company and audit override hands back a guard that
// undoes the change when released. Guards run on drop as well, so an early
// return or a panic unwinding through the scope still restores state.
//
// Guards must be released in LIFO order relative to each other.
//
// ============================================================================

use std::sync::{Mutex, MutexGuard, PoisonError};

type RestoreAction = Box<dyn FnOnce() + Send>;

/// Undo handle returned by override operations
#[must_use = "dropping the guard immediately restores the previous state"]
pub struct RestoreGuard {
    action: Option<RestoreAction>,
}

impl RestoreGuard {
    /// Create a guard that runs `action` exactly once on release
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A guard with nothing to restore
    pub fn noop() -> Self {
        Self { action: None }
    }

    /// Combine guards into one; release runs them in reverse order
    pub fn chain(guards: Vec<RestoreGuard>) -> Self {
        Self::new(move || {
            for guard in guards.into_iter().rev() {
                guard.release();
            }
        })
    }

    /// Restore the previous state now
    pub fn release(mut self) {
        self.run();
    }

    pub fn is_noop(&self) -> bool {
        self.action.is_none()
    }

    fn run(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for RestoreGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreGuard")
            .field("pending", &self.action.is_some())
            .finish()
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Restore actions run inside `Drop`, where a poisoned lock cannot be
/// propagated as an error.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
