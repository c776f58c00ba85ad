//! Resource lifecycle: constructed values paired with release callbacks.
//!
//! A resource factory returns the instance together with its finalizer. The owning
//! scope (or the container's singleton scope) keeps the finalizer in a
//! [`ResourceStack`] and runs it when the scope exits, newest first.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{CleanupFailure, DiError, DiResult};
use crate::key::Key;

/// Type-erased instance. The concrete value is always an `Arc<T>` so that unsized
/// targets (`dyn Trait`) can be stored and handed out without copying.
pub(crate) type Instance = Arc<dyn std::any::Any + Send + Sync>;

pub(crate) fn erase<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Instance {
    Arc::new(value)
}

pub(crate) fn downcast<T: ?Sized + Send + Sync + 'static>(instance: &Instance) -> Option<Arc<T>> {
    instance.downcast_ref::<Arc<T>>().cloned()
}

pub(crate) type SyncRelease = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
pub(crate) type AsyncRelease = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) enum Release {
    Sync(SyncRelease),
    Async(AsyncRelease),
}

/// A value produced by a resource factory together with its synchronous finalizer.
pub struct Resource<T: ?Sized> {
    value: Arc<T>,
    release: SyncRelease,
}

impl<T: Send + Sync + 'static> Resource<T> {
    pub fn new<F>(value: T, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> anyhow::Result<()> + Send + 'static,
    {
        Self::shared(Arc::new(value), release)
    }
}

impl<T: ?Sized + Send + Sync + 'static> Resource<T> {
    /// Resource around an already shared (possibly unsized) value.
    pub fn shared<F>(value: Arc<T>, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> anyhow::Result<()> + Send + 'static,
    {
        let held = Arc::clone(&value);
        Self {
            value,
            release: Box::new(move || release(held)),
        }
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub(crate) fn into_constructed(self) -> Constructed {
        Constructed {
            instance: erase(self.value),
            release: Some(Release::Sync(self.release)),
        }
    }
}

/// A value produced by an async resource factory together with its async finalizer.
pub struct AsyncResource<T: ?Sized> {
    value: Arc<T>,
    release: AsyncRelease,
}

impl<T: Send + Sync + 'static> AsyncResource<T> {
    pub fn new<F, Fut>(value: T, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::shared(Arc::new(value), release)
    }
}

impl<T: ?Sized + Send + Sync + 'static> AsyncResource<T> {
    pub fn shared<F, Fut>(value: Arc<T>, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let held = Arc::clone(&value);
        Self {
            value,
            release: Box::new(move || release(held).boxed()),
        }
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub(crate) fn into_constructed(self) -> Constructed {
        Constructed {
            instance: erase(self.value),
            release: Some(Release::Async(self.release)),
        }
    }
}

/// Output of every constructor: the instance plus an optional finalizer.
pub(crate) struct Constructed {
    pub instance: Instance,
    pub release: Option<Release>,
}

impl Constructed {
    pub fn plain(instance: Instance) -> Self {
        Self {
            instance,
            release: None,
        }
    }
}

/// Finalizer registered by the scope that created the resource.
pub(crate) struct ResourceHandle {
    key: Key,
    release: Release,
}

impl ResourceHandle {
    pub fn new(key: Key, release: Release) -> Self {
        Self { key, release }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn is_async(&self) -> bool {
        matches!(self.release, Release::Async(_))
    }

    /// Runs the finalizer of a resource nobody owns any more. Async finalizers go
    /// to the current runtime when there is one.
    pub fn discard(self) {
        let key = self.key;
        match self.release {
            Release::Sync(release) => {
                if let Err(e) = release() {
                    error!(key = %key, "Finalizer of refused resource failed: {:#}", e);
                }
            }
            Release::Async(release) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = release().await {
                            error!(key = %key, "Finalizer of refused resource failed: {:#}", e);
                        }
                    });
                }
                Err(_) => warn!(key = %key, "No async runtime available; finalizer skipped"),
            },
        }
    }
}

struct Handles {
    pending: Vec<ResourceHandle>,
    released: bool,
}

/// Ordered list of finalizers owned by one scope.
///
/// Releasing the stack closes it: finalizers of constructions that complete
/// afterwards are handed back by [`ResourceStack::push`].
pub(crate) struct ResourceStack {
    owner: String,
    handles: Mutex<Handles>,
}

impl ResourceStack {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            handles: Mutex::new(Handles {
                pending: Vec::new(),
                released: false,
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn push(&self, handle: ResourceHandle) -> Result<(), ResourceHandle> {
        let mut handles = self.handles.lock();
        if handles.released {
            warn!(scope = %self.owner, key = %handle.key, "Resource created after its owner was released");
            return Err(handle);
        }
        debug!(scope = %self.owner, key = %handle.key, "Registered resource finalizer");
        handles.pending.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.lock().pending.len()
    }

    pub fn is_released(&self) -> bool {
        self.handles.lock().released
    }

    pub fn has_async(&self) -> bool {
        self.handles.lock().pending.iter().any(ResourceHandle::is_async)
    }

    fn take_all(&self) -> Vec<ResourceHandle> {
        let mut handles = self.handles.lock();
        handles.released = true;
        std::mem::take(&mut handles.pending)
    }

    /// Runs every finalizer newest first. Async finalizers cannot run here and are
    /// reported as failures.
    pub fn release_all(&self) -> DiResult<()> {
        let handles = self.take_all();
        let mut failures = Vec::new();

        for handle in handles.into_iter().rev() {
            match handle.release {
                Release::Sync(release) => {
                    if let Err(e) = release() {
                        failures.push(CleanupFailure {
                            key: handle.key,
                            message: format!("{:#}", e),
                        });
                    }
                }
                Release::Async(_) => failures.push(CleanupFailure {
                    key: handle.key,
                    message: "async finalizer cannot run on synchronous exit; use exit_async".into(),
                }),
            }
        }

        self.finish(failures)
    }

    /// Runs every finalizer newest first, awaiting async ones.
    pub async fn release_all_async(&self) -> DiResult<()> {
        let handles = self.take_all();
        let mut failures = Vec::new();

        for handle in handles.into_iter().rev() {
            let outcome = match handle.release {
                Release::Sync(release) => release(),
                Release::Async(release) => release().await,
            };
            if let Err(e) = outcome {
                failures.push(CleanupFailure {
                    key: handle.key,
                    message: format!("{:#}", e),
                });
            }
        }

        self.finish(failures)
    }

    /// Release path used from `Drop`, where errors cannot be returned. Async
    /// finalizers are moved to a background task when a tokio runtime is available.
    pub fn release_detached(self: &Arc<Self>) {
        if self.len() == 0 {
            self.take_all();
            return;
        }

        if self.has_async() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let stack = Arc::clone(self);
                handle.spawn(async move {
                    if let Err(e) = stack.release_all_async().await {
                        error!(scope = %stack.owner, "Resource cleanup failed: {}", e);
                    }
                });
                return;
            }
            warn!(
                scope = %self.owner,
                "No async runtime available; async finalizers will be skipped"
            );
        }

        if let Err(e) = self.release_all() {
            error!(scope = %self.owner, "Resource cleanup failed: {}", e);
        }
    }

    fn finish(&self, failures: Vec<CleanupFailure>) -> DiResult<()> {
        if failures.is_empty() {
            debug!(scope = %self.owner, "All resource finalizers completed");
            Ok(())
        } else {
            Err(DiError::ResourceCleanup {
                scope: self.owner.clone(),
                failures,
            })
        }
    }
}
