//! Active container and scope tracking.
//!
//! Each OS thread owns a stack of frames and so does every task running under
//! [`Container::scope_async`](crate::Container::scope_async) or
//! [`Snapshot::scope`]. Lookups consult the task stack first, then the thread
//! stack, then the process-wide default container.
//!
//! The same two levels also carry the construction path: the keys whose
//! constructors are running in the current flow. A resolution started from inside
//! a constructor (a lazy handle, a direct `resolve` call) continues that path, so
//! re-entering a key under construction is reported as a cycle.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::container::Container;
use crate::key::Key;
use crate::scope::ScopeContext;

static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

static DEFAULT_CONTAINER: RwLock<Option<Container>> = RwLock::new(None);

#[derive(Clone)]
pub(crate) struct Frame {
    token: u64,
    pub container: Container,
    pub scope: Option<Arc<ScopeContext>>,
}

thread_local! {
    static THREAD_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_STACK: RefCell<Vec<Frame>>;
}

thread_local! {
    static THREAD_BUILDING: RefCell<Vec<Key>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_BUILDING: Vec<Key>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Task,
    Thread,
}

/// Removes its frame from the stack it was pushed on when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ContextGuard {
    token: u64,
    placement: Placement,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let token = self.token;
        let remove = |stack: &RefCell<Vec<Frame>>| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|frame| frame.token == token) {
                stack.remove(pos);
            }
        };
        match self.placement {
            Placement::Task => {
                let _ = TASK_STACK.try_with(remove);
            }
            Placement::Thread => {
                let _ = THREAD_STACK.try_with(remove);
            }
        }
    }
}

/// Entry points for the per-thread / per-task context stacks.
pub struct ActiveContext;

impl ActiveContext {
    /// The effective container: the explicit one if given, else the top of the
    /// task stack, else the top of the thread stack, else the default container.
    pub fn get_active(explicit: Option<&Container>) -> Option<Container> {
        if let Some(container) = explicit {
            return Some(container.clone());
        }
        let from_task = TASK_STACK
            .try_with(|stack| stack.borrow().last().map(|f| f.container.clone()))
            .ok()
            .flatten();
        if from_task.is_some() {
            return from_task;
        }
        let from_thread = THREAD_STACK
            .try_with(|stack| stack.borrow().last().map(|f| f.container.clone()))
            .ok()
            .flatten();
        from_thread.or_else(default_container)
    }

    /// Pushes a frame on the current task's stack when running inside a task
    /// scope, otherwise on the current thread's stack.
    pub fn push_active(container: &Container, scope: Option<Arc<ScopeContext>>) -> ContextGuard {
        let token = NEXT_FRAME.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            token,
            container: container.clone(),
            scope,
        };

        let mut pending = Some(frame);
        let pushed_to_task = TASK_STACK
            .try_with(|stack| {
                if let Some(frame) = pending.take() {
                    stack.borrow_mut().push(frame);
                }
            })
            .is_ok();

        let placement = if pushed_to_task {
            Placement::Task
        } else {
            if let Some(frame) = pending.take() {
                THREAD_STACK.with(|stack| stack.borrow_mut().push(frame));
            }
            Placement::Thread
        };

        ContextGuard {
            token,
            placement,
            _not_send: PhantomData,
        }
    }

    /// Pops the frame owned by `guard`.
    pub fn pop_active(guard: ContextGuard) {
        drop(guard);
    }

    /// Depth of the visible stacks (task plus thread).
    pub fn depth() -> usize {
        let task = TASK_STACK.try_with(|s| s.borrow().len()).unwrap_or(0);
        let thread = THREAD_STACK.try_with(|s| s.borrow().len()).unwrap_or(0);
        task + thread
    }

    /// Copies the visible frames so they can be re-established inside another task.
    pub fn capture() -> Snapshot {
        let mut frames = THREAD_STACK
            .try_with(|s| s.borrow().clone())
            .unwrap_or_default();
        if let Ok(task) = TASK_STACK.try_with(|s| s.borrow().clone()) {
            frames.extend(task);
        }
        Snapshot { frames }
    }
}

/// Frames captured by [`ActiveContext::capture`].
#[derive(Clone)]
pub struct Snapshot {
    frames: Vec<Frame>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Runs `fut` with the captured frames as its task stack.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        TASK_STACK.scope(RefCell::new(self.frames), fut).await
    }
}

/// Runs `fut` with the current task frames plus `frame` as its task stack.
pub(crate) async fn with_task_frame<F: Future>(
    container: &Container,
    scope: Arc<ScopeContext>,
    fut: F,
) -> F::Output {
    let mut frames = TASK_STACK
        .try_with(|s| s.borrow().clone())
        .unwrap_or_default();
    frames.push(Frame {
        token: NEXT_FRAME.fetch_add(1, Ordering::Relaxed),
        container: container.clone(),
        scope: Some(scope),
    });
    TASK_STACK.scope(RefCell::new(frames), fut).await
}

/// Open scopes of `container_id` visible from here, innermost first.
pub(crate) fn visible_scopes(container_id: u64) -> Vec<Arc<ScopeContext>> {
    let collect = |stack: &RefCell<Vec<Frame>>, out: &mut Vec<Arc<ScopeContext>>| {
        for frame in stack.borrow().iter().rev() {
            if let Some(scope) = &frame.scope {
                if scope.container_id() == container_id && !scope.is_closed() {
                    out.push(Arc::clone(scope));
                }
            }
        }
    };

    let mut scopes = Vec::new();
    let _ = TASK_STACK.try_with(|s| collect(s, &mut scopes));
    let _ = THREAD_STACK.try_with(|s| collect(s, &mut scopes));
    scopes
}

/// Keys under construction in the current flow, outermost first.
///
/// A synchronous constructor never yields, so a non-empty thread path is always
/// the innermost one.
pub(crate) fn construction_path() -> Vec<Key> {
    let on_thread = THREAD_BUILDING
        .try_with(|path| path.borrow().clone())
        .unwrap_or_default();
    if !on_thread.is_empty() {
        return on_thread;
    }
    TASK_BUILDING.try_with(Vec::clone).unwrap_or_default()
}

struct RestorePath(Vec<Key>);

impl Drop for RestorePath {
    fn drop(&mut self) {
        let previous = std::mem::take(&mut self.0);
        let _ = THREAD_BUILDING.try_with(|path| *path.borrow_mut() = previous);
    }
}

/// Runs a synchronous constructor with `path` as the construction path.
pub(crate) fn constructing<R>(path: &[Key], construct: impl FnOnce() -> R) -> R {
    let previous = THREAD_BUILDING.with(|current| current.replace(path.to_vec()));
    let _restore = RestorePath(previous);
    construct()
}

/// Runs an async constructor with `path` as the construction path of its task.
pub(crate) async fn constructing_async<F: Future>(path: Vec<Key>, construct: F) -> F::Output {
    TASK_BUILDING.scope(path, construct).await
}

/// Installs the process-wide default container, returning the previous one.
pub fn install_default(container: Container) -> Option<Container> {
    debug!(container = %container.name(), "Installing default container");
    DEFAULT_CONTAINER.write().replace(container)
}

pub fn clear_default() -> Option<Container> {
    DEFAULT_CONTAINER.write().take()
}

pub fn default_container() -> Option<Container> {
    DEFAULT_CONTAINER.read().clone()
}
