use crate::core::{UowError, lock};
use std::sync::{Arc, Mutex};

type CompletedHandler = Arc<dyn Fn() + Send + Sync>;
type FailedHandler = Arc<dyn Fn(Option<&UowError>, bool) + Send + Sync>;
type DisposedHandler = Arc<dyn Fn() + Send + Sync>;

/// Listeners for the `Completed`, `Failed` and `Disposed` events
#[derive(Default)]
pub struct UnitOfWorkEvents {
    completed: Mutex<Vec<CompletedHandler>>,
    failed: Mutex<Vec<FailedHandler>>,
    disposed: Mutex<Vec<DisposedHandler>>,
}

impl UnitOfWorkEvents {
    pub fn on_completed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.completed).push(Arc::new(handler));
    }

    /// `handler` receives the recorded failure (if any) and whether it is retriable
    pub fn on_failed<F>(&self, handler: F)
    where
        F: Fn(Option<&UowError>, bool) + Send + Sync + 'static,
    {
        lock(&self.failed).push(Arc::new(handler));
    }

    pub fn on_disposed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.disposed).push(Arc::new(handler));
    }

    // Handlers are cloned out so a handler may register further handlers.

    pub(crate) fn raise_completed(&self) {
        let handlers = lock(&self.completed).clone();
        for handler in handlers {
            handler();
        }
    }

    pub(crate) fn raise_failed(&self, error: Option<&UowError>) {
        let retriable = error.is_some_and(UowError::is_retriable);
        let handlers = lock(&self.failed).clone();
        for handler in handlers {
            handler(error, retriable);
        }
    }

    pub(crate) fn raise_disposed(&self) {
        let handlers = lock(&self.disposed).clone();
        for handler in handlers {
            handler();
        }
    }
}
