//! Pluggable hook points.
//!
//! Every stateful component owns a handful of typed [`Hook`] points and
//! triggers them at lifecycle events. Plugins attach two kinds of callbacks:
//!
//! - **read hooks** observe a payload by reference. They run synchronously
//!   and may fail, in which case the error propagates to whoever triggered
//!   the event.
//! - **write hooks** receive the payload by value and return it (possibly
//!   changed) from a future. Each write hook sees the output of the one
//!   registered before it, and the final value is handed back to the
//!   triggering component.
//!
//! Callbacks for one hook point run strictly in registration order.
//!
//! ```ignore
//! let hook: Hook<FileNameRequest> = Hook::new("onFileName");
//! let handle = hook.write_hook("flat-names", |mut request| async move {
//!     request.file_name = format!("{}.png", request.request_id);
//!     Ok(request)
//! });
//! let request = hook.call(request).await?;
//! hook.remove(handle);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

/// Error type plugin callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of plugin callbacks.
pub type HookResult<T> = Result<T, BoxError>;

type ReadCallback<P> = Arc<dyn Fn(&P) -> HookResult<()> + Send + Sync>;
type WriteCallback<P> = Arc<dyn Fn(P) -> BoxFuture<'static, HookResult<P>> + Send + Sync>;

/// A plugin callback failed while a hook point was being triggered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Hook `{hook}` failed in plugin `{plugin}`: {message}")]
pub struct HookError {
    pub hook: &'static str,
    pub plugin: String,
    pub message: String,
}

/// Identifies one registered callback so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    id: u64,
}

struct Registered<C> {
    id: u64,
    plugin: String,
    callback: C,
}

struct Callbacks<P> {
    read: Vec<Registered<ReadCallback<P>>>,
    write: Vec<Registered<WriteCallback<P>>>,
}

impl<P> Default for Callbacks<P> {
    fn default() -> Self {
        Self {
            read: Vec::new(),
            write: Vec::new(),
        }
    }
}

/// A named hook point carrying payloads of type `P`.
pub struct Hook<P> {
    name: &'static str,
    callbacks: RwLock<Callbacks<P>>,
    next_id: AtomicU64,
}

impl<P> fmt::Debug for Hook<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (read, write) = {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            (callbacks.read.len(), callbacks.write.len())
        };
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("read_hooks", &read)
            .field("write_hooks", &write)
            .finish()
    }
}

impl<P: Send + 'static> Hook<P> {
    /// Create an empty hook point.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: RwLock::new(Callbacks::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Name of the hook point, e.g. `beforeTest`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register an observer.
    pub fn read_hook<F>(&self, plugin: impl Into<String>, callback: F) -> HookHandle
    where
        F: Fn(&P) -> HookResult<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_write().read.push(Registered {
            id,
            plugin: plugin.into(),
            callback: Arc::new(callback),
        });
        HookHandle { id }
    }

    /// Register a transforming callback.
    pub fn write_hook<F, Fut>(&self, plugin: impl Into<String>, callback: F) -> HookHandle
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<P>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let callback: WriteCallback<P> = Arc::new(move |payload| callback(payload).boxed());
        self.lock_write().write.push(Registered {
            id,
            plugin: plugin.into(),
            callback,
        });
        HookHandle { id }
    }

    /// Unregister a callback. Returns `false` when it was already gone.
    pub fn remove(&self, handle: HookHandle) -> bool {
        let mut callbacks = self.lock_write();
        let before = callbacks.read.len() + callbacks.write.len();
        callbacks.read.retain(|r| r.id != handle.id);
        callbacks.write.retain(|r| r.id != handle.id);
        before != callbacks.read.len() + callbacks.write.len()
    }

    /// Unregister every callback a plugin attached. Returns how many were removed.
    pub fn remove_plugin(&self, plugin: &str) -> usize {
        let mut callbacks = self.lock_write();
        let before = callbacks.read.len() + callbacks.write.len();
        callbacks.read.retain(|r| r.plugin != plugin);
        callbacks.write.retain(|r| r.plugin != plugin);
        before - (callbacks.read.len() + callbacks.write.len())
    }

    /// Number of registered callbacks of both kinds.
    pub fn len(&self) -> usize {
        let callbacks = self.lock_read();
        callbacks.read.len() + callbacks.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run only the read hooks against `payload`.
    pub fn notify(&self, payload: &P) -> Result<(), HookError> {
        for (plugin, callback) in self.readers() {
            callback(payload).map_err(|e| self.error(plugin, e))?;
        }
        Ok(())
    }

    /// Thread `payload` through the write hooks, then show the result to the
    /// read hooks.
    pub async fn call(&self, payload: P) -> Result<P, HookError> {
        let mut payload = payload;
        for (plugin, callback) in self.writers() {
            payload = callback(payload)
                .await
                .map_err(|e| self.error(plugin, e))?;
        }
        self.notify(&payload)?;
        Ok(payload)
    }

    // Callbacks never run under the lock, so a poisoned lock still guards
    // consistent lists and is safe to recover.
    fn lock_read(&self) -> RwLockReadGuard<'_, Callbacks<P>> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, Callbacks<P>> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Snapshots keep the lock out of user callbacks, so a callback may
    // register or remove hooks on the same point.
    fn readers(&self) -> Vec<(String, ReadCallback<P>)> {
        self.lock_read()
            .read
            .iter()
            .map(|r| (r.plugin.clone(), Arc::clone(&r.callback)))
            .collect()
    }

    fn writers(&self) -> Vec<(String, WriteCallback<P>)> {
        self.lock_read()
            .write
            .iter()
            .map(|r| (r.plugin.clone(), Arc::clone(&r.callback)))
            .collect()
    }

    fn error(&self, plugin: String, source: BoxError) -> HookError {
        HookError {
            hook: self.name,
            plugin,
            message: source.to_string(),
        }
    }
}
