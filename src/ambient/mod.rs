// ============================================================================
// Ambient Context
// ============================================================================
//
// Call-chain scoped override values (current unit of work, run-as session,
// anything else that must be visible to nested code without being passed
// down explicitly).
//
// A logical chain is rooted by `AmbientContext::scope` (async) or
// `AmbientContext::sync_scope` (blocking). The root lives in tokio
// task-local storage, so it follows the future across `.await` points and
// worker threads, and two independent chains never observe each other.
// `spawn` hands a copy of the visible values to a child task.
//
// Every future polled under one root shares its stacks. Concurrent branches
// of one chain (`join!`, `select!`) must each run under `branch`, which gives
// the branch a private copy of the visible values, exactly like `spawn`.
//
// Scopes are a stack per key. `ScopeHandle` pops exactly the frame it pushed
// and refuses to pop a frame that is not on top: release order must be LIFO.
//
// ============================================================================

use crate::core::{Result, UowError, lock};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

tokio::task_local! {
    static AMBIENT: AmbientContext;
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Frame {
    id: u64,
    value: Arc<dyn Any + Send + Sync>,
}

/// Root of one logical call chain
#[derive(Clone, Default)]
pub struct AmbientContext {
    frames: Arc<Mutex<HashMap<String, Vec<Frame>>>>,
}

impl AmbientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context of the current call chain, if one is installed
    pub fn current() -> Option<Self> {
        AMBIENT.try_with(Clone::clone).ok()
    }

    pub fn is_installed() -> bool {
        AMBIENT.try_with(|_| ()).is_ok()
    }

    /// Run `fut` as a new logical chain rooted at this context
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        AMBIENT.scope(self, fut).await
    }

    /// Run `f` synchronously as a new logical chain rooted at this context
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        AMBIENT.sync_scope(self, f)
    }

    /// Run `fut` in the current chain, or in a fresh one if none is installed
    pub async fn run<F: Future>(fut: F) -> F::Output {
        if Self::is_installed() {
            fut.await
        } else {
            Self::new().scope(fut).await
        }
    }

    /// Blocking counterpart of [`AmbientContext::run`]
    pub fn run_blocking<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if Self::is_installed() {
            f()
        } else {
            Self::new().sync_scope(f)
        }
    }

    /// Run `fut` on a private copy of the current chain's visible values.
    ///
    /// Scopes the branch begins are invisible to its siblings and to the
    /// caller, and may be released in any order relative to theirs. Without
    /// an installed chain the branch starts from an empty context.
    pub async fn branch<F: Future>(fut: F) -> F::Output {
        Self::forked().scope(fut).await
    }

    /// Blocking counterpart of [`AmbientContext::branch`]
    pub fn branch_blocking<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        Self::forked().sync_scope(f)
    }

    fn forked() -> Self {
        Self::current().map(|ctx| ctx.fork()).unwrap_or_default()
    }

    /// Copy the currently visible values into an independent context.
    ///
    /// Frames pushed in the fork are invisible to the original and vice versa.
    pub fn fork(&self) -> Self {
        let frames = lock(&self.frames).clone();
        Self {
            frames: Arc::new(Mutex::new(frames)),
        }
    }

    fn push(&self, key: &str, value: Arc<dyn Any + Send + Sync>) -> u64 {
        let id = NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed);
        lock(&self.frames)
            .entry(key.to_string())
            .or_default()
            .push(Frame { id, value });
        id
    }

    fn top(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        lock(&self.frames)
            .get(key)
            .and_then(|stack| stack.last())
            .map(|frame| frame.value.clone())
    }

    fn depth(&self, key: &str) -> usize {
        lock(&self.frames).get(key).map_or(0, Vec::len)
    }

    fn pop(&self, key: &str, frame_id: u64) -> Result<()> {
        let mut frames = lock(&self.frames);
        let Some(stack) = frames.get_mut(key) else {
            return Ok(());
        };

        if stack.last().map(|frame| frame.id) == Some(frame_id) {
            stack.pop();
            if stack.is_empty() {
                frames.remove(key);
            }
            return Ok(());
        }

        if stack.iter().any(|frame| frame.id == frame_id) {
            return Err(UowError::ScopeReleasedOutOfOrder(key.to_string()));
        }

        // Already gone: nothing left to restore.
        Ok(())
    }
}

impl std::fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = lock(&self.frames).keys().cloned().collect();
        f.debug_struct("AmbientContext").field("keys", &keys).finish()
    }
}

/// Spawn `fut` on the tokio runtime with a copy of the current ambient values
pub fn spawn<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(AmbientContext::forked().scope(fut))
}

/// Typed view over one family of ambient override stacks
pub struct AmbientScopeStack<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AmbientScopeStack<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Push `value` under `key` for the rest of the current call chain
    ///
    /// # Errors
    /// Returns `NoAmbientContext` when no chain root is installed.
    pub fn begin_scope(&self, key: &str, value: T) -> Result<ScopeHandle> {
        let context = AmbientContext::current().ok_or(UowError::NoAmbientContext)?;
        let full_key = self.full_key(key);
        let frame_id = context.push(&full_key, Arc::new(value));
        Ok(ScopeHandle {
            context,
            key: full_key,
            frame_id,
            released: false,
        })
    }

    /// The innermost value visible under `key`, if any
    pub fn get_value(&self, key: &str) -> Option<T> {
        let context = AmbientContext::current()?;
        context
            .top(&self.full_key(key))
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Number of nested scopes currently pushed under `key`
    pub fn depth(&self, key: &str) -> usize {
        AmbientContext::current().map_or(0, |ctx| ctx.depth(&self.full_key(key)))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.name, key)
    }
}

/// Pops the frame pushed by [`AmbientScopeStack::begin_scope`]
#[must_use = "dropping the handle immediately ends the scope"]
pub struct ScopeHandle {
    context: AmbientContext,
    key: String,
    frame_id: u64,
    released: bool,
}

impl ScopeHandle {
    /// End the scope, restoring the previously visible value
    ///
    /// # Errors
    /// Returns `ScopeReleasedOutOfOrder` if a scope pushed later under the
    /// same key is still open. The stack is left untouched in that case.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.context.pop(&self.key, self.frame_id)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.context.pop(&self.key, self.frame_id) {
            error!(key = %self.key, "{}", err);
        }
    }
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("key", &self.key)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}
