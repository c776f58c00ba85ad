//! Scope management: single-flight instance caches and scope lifetimes.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use common::OperationTimer;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn, Level};

use crate::context::{self, ContextGuard};
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::resource::{Instance, ResourceStack};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
enum Outcome {
    Done(DiResult<Instance>),
    /// The leader went away (cancelled or panicked) before producing a value.
    Abandoned,
}

/// One construction in progress. Sync waiters block on the condvar, async
/// waiters on the notify.
struct InFlight {
    state: Mutex<Option<Outcome>>,
    ready: Condvar,
    notify: Notify,
    leader: Option<ThreadId>,
}

impl InFlight {
    fn new(leader: Option<ThreadId>) -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
            notify: Notify::new(),
            leader,
        }
    }

    fn complete(&self, outcome: Outcome) {
        *self.state.lock() = Some(outcome);
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    fn wait_blocking(&self) -> Outcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut state);
        }
    }

    async fn wait(&self) -> Outcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.state.lock().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            notified.await;
        }
    }
}

enum Slot {
    Ready(Instance),
    Pending(Arc<InFlight>),
}

enum Claim<'a> {
    Ready(Instance),
    Wait(Arc<InFlight>),
    Lead(Leader<'a>),
}

/// Held by the caller that performs a construction. Dropping it without calling
/// `finish` marks the construction as abandoned and frees the slot.
struct Leader<'a> {
    cache: &'a InstanceCache,
    key: Key,
    flight: Arc<InFlight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, result: &DiResult<Instance>) {
        self.finished = true;
        {
            let mut slots = self.cache.slots.lock();
            let ours = matches!(
                slots.get(&self.key),
                Some(Slot::Pending(flight)) if Arc::ptr_eq(flight, &self.flight)
            );
            if ours {
                match result {
                    Ok(instance) => {
                        slots.insert(self.key.clone(), Slot::Ready(Arc::clone(instance)));
                    }
                    Err(_) => {
                        slots.remove(&self.key);
                    }
                }
            }
        }
        self.flight.complete(Outcome::Done(result.clone()));
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(key = %self.key, "Construction abandoned before completion; releasing slot");
        {
            let mut slots = self.cache.slots.lock();
            let ours = matches!(
                slots.get(&self.key),
                Some(Slot::Pending(flight)) if Arc::ptr_eq(flight, &self.flight)
            );
            if ours {
                slots.remove(&self.key);
            }
        }
        self.flight.complete(Outcome::Abandoned);
    }
}

/// Waiting on a key that the current flow is itself constructing never completes.
fn reentry(key: &Key) -> Option<DiError> {
    let mut path = context::construction_path();
    let start = path.iter().position(|building| building == key)?;
    path.push(key.clone());
    debug!(key = %key, "Re-entrant construction detected");
    Some(DiError::CircularDependency {
        path: path.split_off(start),
    })
}

/// Per-scope instance cache with single-flight construction per key.
///
/// The first caller for a missing key becomes the leader and runs the constructor
/// outside of the cache lock; concurrent callers wait for its outcome. A failure is
/// delivered to every waiter and leaves the slot empty.
pub(crate) struct InstanceCache {
    slots: Mutex<HashMap<Key, Slot>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &Key) -> Option<Instance> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(instance)) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    fn claim(&self, key: &Key, leader: Option<ThreadId>) -> Claim<'_> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready(instance)) => Claim::Ready(Arc::clone(instance)),
            Some(Slot::Pending(flight)) => Claim::Wait(Arc::clone(flight)),
            None => {
                let flight = Arc::new(InFlight::new(leader));
                slots.insert(key.clone(), Slot::Pending(Arc::clone(&flight)));
                Claim::Lead(Leader {
                    cache: self,
                    key: key.clone(),
                    flight,
                    finished: false,
                })
            }
        }
    }

    /// Returns the cached instance or runs `create` exactly once across all
    /// concurrent callers. `path` is used to report re-entrant construction of
    /// the same key on the same thread.
    pub fn get_or_create<F>(&self, key: &Key, path: &[Key], create: F) -> DiResult<Instance>
    where
        F: FnOnce() -> DiResult<Instance>,
    {
        let current = thread::current().id();
        let leader = loop {
            match self.claim(key, Some(current)) {
                Claim::Ready(instance) => return Ok(instance),
                Claim::Wait(flight) => {
                    if let Some(cycle) = reentry(key) {
                        return Err(cycle);
                    }
                    if flight.leader == Some(current) {
                        let mut cycle = path.to_vec();
                        cycle.push(key.clone());
                        return Err(DiError::CircularDependency { path: cycle });
                    }
                    match flight.wait_blocking() {
                        Outcome::Done(result) => return result,
                        Outcome::Abandoned => continue,
                    }
                }
                Claim::Lead(leader) => break leader,
            }
        };

        let result = create();
        leader.finish(&result);
        result
    }

    pub async fn get_or_create_async<Fut>(&self, key: &Key, create: Fut) -> DiResult<Instance>
    where
        Fut: Future<Output = DiResult<Instance>>,
    {
        let leader = loop {
            match self.claim(key, None) {
                Claim::Ready(instance) => return Ok(instance),
                Claim::Wait(flight) => {
                    if let Some(cycle) = reentry(key) {
                        return Err(cycle);
                    }
                    match flight.wait().await {
                        Outcome::Done(result) => return result,
                        Outcome::Abandoned => continue,
                    }
                }
                Claim::Lead(leader) => break leader,
            }
        };

        let result = create.await;
        leader.finish(&result);
        result
    }

    pub fn remove(&self, key: &Key) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Ready(_))) {
            slots.remove(key);
            true
        } else {
            false
        }
    }

    /// Drops every ready instance. Constructions in flight keep their slots.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| matches!(slot, Slot::Pending(_)));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}

/// State of one entered scope: its cache and the finalizers of the resources it
/// created. Two scopes with the same name never share state.
pub struct ScopeContext {
    name: Cow<'static, str>,
    id: u64,
    container_id: u64,
    pub(crate) cache: InstanceCache,
    pub(crate) resources: Arc<ResourceStack>,
    closed: AtomicBool,
}

impl ScopeContext {
    pub(crate) fn new(name: impl Into<Cow<'static, str>>, container_id: u64) -> Self {
        let name = name.into();
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            resources: Arc::new(ResourceStack::new(name.to_string())),
            name,
            id,
            container_id,
            cache: InstanceCache::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of instances cached in this scope.
    pub fn instance_count(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn container_id(&self) -> u64 {
        self.container_id
    }

    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn close(&self) -> DiResult<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        let mut timer = OperationTimer::new("scope_exit").with_level(Level::DEBUG);
        timer.add_field("scope", self.name.as_ref());
        timer.add_field("items", self.resources.len());

        let result = self.resources.release_all();
        self.cache.clear();
        timer.finish_with_result(&result);
        result
    }

    pub(crate) async fn close_async(&self) -> DiResult<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        let mut timer = OperationTimer::new("scope_exit_async").with_level(Level::DEBUG);
        timer.add_field("scope", self.name.as_ref());
        timer.add_field("items", self.resources.len());

        let result = self.resources.release_all_async().await;
        self.cache.clear();
        timer.finish_with_result(&result);
        result
    }

    /// Close from a destructor: errors are logged, async finalizers are spawned.
    pub(crate) fn close_detached(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!(scope = %self.name, id = self.id, "Scope dropped without explicit exit");
        self.resources.release_detached();
        self.cache.clear();
    }
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes a scope when dropped unless it was already closed explicitly.
pub(crate) struct ScopeExit {
    scope: Arc<ScopeContext>,
}

impl ScopeExit {
    pub fn new(scope: Arc<ScopeContext>) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &Arc<ScopeContext> {
        &self.scope
    }
}

impl Drop for ScopeExit {
    fn drop(&mut self) {
        if !self.scope.is_closed() {
            self.scope.close_detached();
        }
    }
}

/// RAII handle for an entered scope.
///
/// While the guard lives the scope is the innermost active scope of the current
/// thread (or of the current task when entered inside
/// [`Container::scope_async`](crate::Container::scope_async)). Dropping it exits
/// the scope; [`ScopeGuard::exit`] does the same and reports finalizer errors.
#[must_use = "the scope exits as soon as the guard is dropped"]
pub struct ScopeGuard {
    context: Option<ContextGuard>,
    exit: ScopeExit,
    _not_send: PhantomData<*const ()>,
}

impl ScopeGuard {
    pub(crate) fn new(scope: Arc<ScopeContext>, context: ContextGuard) -> Self {
        Self {
            context: Some(context),
            exit: ScopeExit::new(scope),
            _not_send: PhantomData,
        }
    }

    pub fn context(&self) -> &Arc<ScopeContext> {
        self.exit.scope()
    }

    pub fn name(&self) -> &str {
        self.exit.scope().name()
    }

    pub fn id(&self) -> u64 {
        self.exit.scope().id()
    }

    /// Exits the scope, running finalizers newest first.
    pub fn exit(mut self) -> DiResult<()> {
        self.context.take();
        self.exit.scope().close()
    }

    /// Leaves the scope immediately and returns a future that runs the
    /// finalizers, awaiting async ones.
    pub fn exit_async(mut self) -> impl Future<Output = DiResult<()>> + Send + 'static {
        self.context.take();
        let scope = Arc::clone(self.exit.scope());
        async move { scope.close_async().await }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScopeGuard").field(self.exit.scope()).finish()
    }
}
