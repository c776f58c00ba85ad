//! The container: registry, singleton cache and root resources behind one handle.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use common::OperationTimer;
use indexmap::IndexMap;
use tracing::{debug, info, Level};

use crate::binding::{Binding, BindingBuilder};
use crate::component::{ComponentRegistry, ComponentSpec, ComponentState};
use crate::config::ContainerConfig;
use crate::context::{self, ActiveContext, ContextGuard};
use crate::error::{DiError, DiResult};
use crate::invoke::{Arguments, Invocable};
use crate::key::Key;
use crate::module::{Binder, Module};
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::resource::{downcast, Instance, ResourceStack};
use crate::scope::{InstanceCache, ScopeContext, ScopeExit, ScopeGuard};
use crate::validation::DependencyGraph;

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of the container counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub resolutions: u64,
    pub cache_hits: u64,
    pub constructions: u64,
    pub failures: u64,
    pub bindings: usize,
    pub singletons: usize,
}

impl ContainerStats {
    pub fn hit_rate(&self) -> f64 {
        if self.resolutions == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.resolutions as f64
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    enabled: bool,
    resolutions: AtomicU64,
    cache_hits: AtomicU64,
    constructions: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.enabled {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requested(&self) {
        self.bump(&self.resolutions);
    }

    pub fn hit(&self) {
        self.bump(&self.cache_hits);
    }

    pub fn constructed(&self) {
        self.bump(&self.constructions);
    }

    pub fn failed(&self) {
        self.bump(&self.failures);
    }
}

pub(crate) struct ContainerInner {
    id: u64,
    config: ContainerConfig,
    registry: Registry,
    singletons: InstanceCache,
    root: Arc<ResourceStack>,
    components: ComponentRegistry,
    counters: Counters,
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        debug!(container = %self.config.name, "Container dropped; releasing singleton resources");
        self.root.release_detached();
    }
}

/// Handle to a set of bindings and the instances built from them.
///
/// Cloning is cheap; clones share registry, caches and resources.
///
/// ```ignore
/// let container = Container::new();
/// container.bind(Binding::of::<Database>().to_factory(|_| Database::connect()))?;
/// container.bind(Binding::of::<UserService>().to_class())?;
/// let service = container.resolve::<UserService>()?;
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn cast<T: ?Sized + Send + Sync + 'static>(key: &Key, instance: &Instance) -> DiResult<Arc<T>> {
    downcast::<T>(instance).ok_or_else(|| DiError::TypeMismatch {
        key: key.clone(),
        expected: type_name::<T>(),
    })
}

impl Container {
    pub fn new() -> Self {
        Self::with_config(ContainerConfig::default())
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        let id = NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed);
        debug!(container = %config.name, id, "Creating container");
        Self {
            inner: Arc::new(ContainerInner {
                id,
                root: Arc::new(ResourceStack::new(format!("{}:singleton", config.name))),
                counters: Counters::new(config.track_stats),
                registry: Registry::new(),
                singletons: InstanceCache::new(),
                components: ComponentRegistry::new(),
                config,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    pub(crate) fn from_inner(inner: Arc<ContainerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContainerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn singletons(&self) -> &InstanceCache {
        &self.inner.singletons
    }

    pub(crate) fn root_resources(&self) -> Arc<ResourceStack> {
        Arc::clone(&self.inner.root)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self, Vec::new())
    }

    // ---- registration ----

    /// Validates and stores a binding.
    pub fn bind(&self, binding: impl Into<BindingBuilder>) -> DiResult<()> {
        self.register(binding.into().build()?)
    }

    /// Stores an already built binding. Replacing a key drops its cached singleton.
    pub fn register(&self, binding: Binding) -> DiResult<()> {
        let key = binding.key().clone();
        let previous = self
            .inner
            .registry
            .bind(binding, self.inner.config.allow_override)?;
        if previous.is_some() {
            self.inner.singletons.remove(&key);
        }
        Ok(())
    }

    pub fn unbind(&self, key: &Key) -> Option<Binding> {
        let removed = self.inner.registry.unbind(key);
        if removed.is_some() {
            self.inner.singletons.remove(key);
        }
        removed
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.registry.contains(key)
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.contains(&Key::of::<T>())
    }

    pub fn binding(&self, key: &Key) -> Option<Binding> {
        self.inner.registry.lookup(key)
    }

    /// Applies `module` and returns the keys it bound.
    pub fn install(&self, module: &dyn Module) -> DiResult<Vec<Key>> {
        info!(container = %self.name(), module = module.name(), "Installing module");
        let mut binder = Binder::new(self);
        module.configure(&mut binder)?;
        let keys = binder.into_registered();

        if self.inner.config.validate_on_install {
            if let Some(first) = self.validate().into_iter().next() {
                return Err(first);
            }
        }
        Ok(keys)
    }

    /// Replaces a binding until the returned guard is dropped.
    pub fn override_binding(&self, binding: impl Into<BindingBuilder>) -> DiResult<OverrideGuard> {
        let binding = binding.into().build()?;
        let key = binding.key().clone();
        let previous = self.inner.registry.bind(binding, true)?;
        self.inner.singletons.remove(&key);
        debug!(key = %key, "Binding overridden for the lifetime of a guard");
        Ok(OverrideGuard {
            container: self.clone(),
            key,
            previous: Some(previous),
        })
    }

    // ---- resolution ----

    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.resolve_key(&Key::of::<T>())
    }

    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> DiResult<Arc<T>> {
        self.resolve_key(&Key::named(name))
    }

    pub fn resolve_key<T: ?Sized + Send + Sync + 'static>(&self, key: &Key) -> DiResult<Arc<T>> {
        let instance = self.resolver().resolve_required(key)?;
        cast::<T>(key, &instance)
    }

    /// `Ok(None)` when the key is not bound or bound to an explicit null.
    pub fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>> {
        self.try_resolve_key(&Key::of::<T>())
    }

    pub fn try_resolve_key<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
    ) -> DiResult<Option<Arc<T>>> {
        if !self.contains(key) {
            return Ok(None);
        }
        match self.resolver().resolve_optional(key)? {
            Some(instance) => cast::<T>(key, &instance).map(Some),
            None => Ok(None),
        }
    }

    /// Resolves with `scope` searched before the context stacks.
    pub fn resolve_in<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
        scope: &Arc<ScopeContext>,
    ) -> DiResult<Arc<T>> {
        let instance = Resolver::new(self, vec![Arc::clone(scope)]).resolve_required(key)?;
        cast::<T>(key, &instance)
    }

    pub async fn resolve_async<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.resolve_key_async(&Key::of::<T>()).await
    }

    pub async fn resolve_named_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> DiResult<Arc<T>> {
        self.resolve_key_async(&Key::named(name)).await
    }

    pub async fn resolve_key_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
    ) -> DiResult<Arc<T>> {
        let instance = self.resolver().resolve_required_async(key).await?;
        cast::<T>(key, &instance)
    }

    pub async fn try_resolve_async<T: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> DiResult<Option<Arc<T>>> {
        let key = Key::of::<T>();
        if !self.contains(&key) {
            return Ok(None);
        }
        match self.resolver().resolve_optional_async(&key).await? {
            Some(instance) => cast::<T>(&key, &instance).map(Some),
            None => Ok(None),
        }
    }

    pub async fn resolve_in_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
        scope: &Arc<ScopeContext>,
    ) -> DiResult<Arc<T>> {
        let instance = Resolver::new(self, vec![Arc::clone(scope)])
            .resolve_required_async(key)
            .await?;
        cast::<T>(key, &instance)
    }

    // ---- scopes ----

    /// Makes this container the active one on the current thread or task until
    /// the guard is dropped.
    pub fn activate(&self) -> ContextGuard {
        ActiveContext::push_active(self, None)
    }

    /// Enters a new scope named `name`. Scoped bindings with that name share one
    /// instance per entered scope.
    pub fn enter_scope(&self, name: impl Into<Cow<'static, str>>) -> ScopeGuard {
        let scope = Arc::new(ScopeContext::new(name, self.id()));
        debug!(scope = %scope.name(), id = scope.id(), "Entering scope");
        let context = ActiveContext::push_active(self, Some(Arc::clone(&scope)));
        ScopeGuard::new(scope, context)
    }

    /// Runs `f` inside a fresh scope. Finalizer failures on exit are returned in
    /// place of `f`'s output.
    pub fn scope<R>(
        &self,
        name: impl Into<Cow<'static, str>>,
        f: impl FnOnce(&ScopeGuard) -> R,
    ) -> DiResult<R> {
        let guard = self.enter_scope(name);
        let output = f(&guard);
        guard.exit()?;
        Ok(output)
    }

    /// Runs `fut` as a task with its own context stack containing a fresh scope.
    /// If the returned future is dropped early the scope is still closed.
    pub async fn scope_async<F: Future>(
        &self,
        name: impl Into<Cow<'static, str>>,
        fut: F,
    ) -> DiResult<F::Output> {
        let scope = Arc::new(ScopeContext::new(name, self.id()));
        debug!(scope = %scope.name(), id = scope.id(), "Entering task scope");
        let exit = ScopeExit::new(Arc::clone(&scope));

        let output = context::with_task_frame(self, Arc::clone(&scope), fut).await;
        exit.scope().close_async().await?;
        Ok(output)
    }

    /// Drops cached instances of the visible open scopes named `name`. Returns the
    /// number of instances dropped.
    pub fn clear_scope(&self, name: &str) -> usize {
        context::visible_scopes(self.id())
            .iter()
            .filter(|scope| scope.name() == name)
            .map(|scope| scope.cache.clear())
            .sum()
    }

    /// Drops every cached singleton and every cached instance of visible scopes.
    /// Resources stay registered until their owner exits.
    pub fn clear_all(&self) -> usize {
        let scoped: usize = context::visible_scopes(self.id())
            .iter()
            .map(|scope| scope.cache.clear())
            .sum();
        scoped + self.inner.singletons.clear()
    }

    // ---- invocation ----

    /// Calls the factory bound to `key` with `args`, resolving the remaining
    /// parameters. The result is never cached.
    pub fn invoke<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
        args: Arguments,
    ) -> DiResult<Arc<T>> {
        let binding = self.invocation_target(key)?;
        let instance = self.resolver().invoke(&binding, &args)?;
        cast::<T>(key, &instance)
    }

    pub async fn invoke_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key,
        args: Arguments,
    ) -> DiResult<Arc<T>> {
        let binding = self.invocation_target(key)?;
        let instance = self.resolver().invoke_async(&binding, &args).await?;
        cast::<T>(key, &instance)
    }

    /// Invokes a callable that is not registered.
    pub fn call<T: ?Sized + Send + Sync + 'static>(
        &self,
        callable: &Invocable<T>,
        args: Arguments,
    ) -> DiResult<Arc<T>> {
        let instance = self.resolver().invoke(callable.binding(), &args)?;
        cast::<T>(callable.name(), &instance)
    }

    pub async fn call_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        callable: &Invocable<T>,
        args: Arguments,
    ) -> DiResult<Arc<T>> {
        let instance = self
            .resolver()
            .invoke_async(callable.binding(), &args)
            .await?;
        cast::<T>(callable.name(), &instance)
    }

    fn invocation_target(&self, key: &Key) -> DiResult<Binding> {
        self.inner
            .registry
            .lookup(key)
            .ok_or_else(|| DiError::not_found(key, None, std::slice::from_ref(key)))
    }

    // ---- components ----

    pub fn register_component(&self, spec: ComponentSpec) -> DiResult<()> {
        self.inner.components.register(spec)
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.inner.components
    }

    /// Starts the named components, or every auto-start one, together with the
    /// components they depend on.
    pub fn start_components(&self, names: Option<&[&str]>) -> DiResult<Vec<String>> {
        self.inner.components.start(names, self)
    }

    /// Stops started components in reverse start order.
    pub fn stop_components(&self, names: Option<&[&str]>) -> DiResult<Vec<String>> {
        self.inner.components.stop(names)
    }

    pub fn component_states(&self) -> IndexMap<String, ComponentState> {
        self.inner.components.states()
    }

    // ---- diagnostics ----

    /// Every missing dependency and cycle among the current bindings. Nothing is
    /// constructed.
    pub fn validate(&self) -> Vec<DiError> {
        let mut timer = OperationTimer::new("container_validate").with_level(Level::DEBUG);
        timer.add_field("container", self.name());
        timer.add_field("items", self.inner.registry.len());

        let errors = self.inner.registry.validate_all();
        timer.add_field("errors", errors.len());
        timer.finish();
        errors
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::from_bindings(&self.inner.registry.snapshot())
    }

    pub fn stats(&self) -> ContainerStats {
        let counters = &self.inner.counters;
        ContainerStats {
            resolutions: counters.resolutions.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            constructions: counters.constructions.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            bindings: self.inner.registry.len(),
            singletons: self.inner.singletons.len(),
        }
    }

    // ---- shutdown ----

    /// Stops started components, drops cached singletons and runs singleton
    /// finalizers newest first. Resources constructed afterwards are refused.
    pub fn shutdown(&self) -> DiResult<()> {
        info!(container = %self.name(), "Shutting down container");
        let stopped = self.inner.components.stop(None);
        let result = self.inner.root.release_all();
        self.inner.singletons.clear();
        stopped.and(result)
    }

    pub async fn shutdown_async(&self) -> DiResult<()> {
        info!(container = %self.name(), "Shutting down container");
        let stopped = self.inner.components.stop(None);
        let result = self.inner.root.release_all_async().await;
        self.inner.singletons.clear();
        stopped.and(result)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("bindings", &self.inner.registry.len())
            .finish()
    }
}

/// Restores the replaced binding (or removes the override) when dropped.
#[must_use = "the override is reverted as soon as the guard is dropped"]
pub struct OverrideGuard {
    container: Container,
    key: Key,
    previous: Option<Option<Binding>>,
}

impl OverrideGuard {
    pub fn key(&self) -> &Key {
        &self.key
    }
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.container.registry().restore(&self.key, previous);
            self.container.singletons().remove(&self.key);
            debug!(key = %self.key, "Override reverted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Param;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Config {
        url: String,
    }

    #[test]
    fn test_singleton_identity_and_stats() {
        let container = Container::new();
        container
            .bind(Binding::of::<Config>().to_factory(|_| {
                Ok(Config {
                    url: "sqlite::memory:".into(),
                })
            }))
            .unwrap();

        let a = container.resolve::<Config>().unwrap();
        let b = container.resolve::<Config>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.url, "sqlite::memory:");

        let stats = container.stats();
        assert_eq!(stats.resolutions, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.constructions, 1);
        assert_eq!(stats.singletons, 1);
    }

    #[test]
    fn test_stats_can_be_disabled() {
        let container = Container::with_config(ContainerConfig::default().with_track_stats(false));
        container.bind(Binding::of::<u8>().to_value(1)).unwrap();
        container.resolve::<u8>().unwrap();
        assert_eq!(container.stats().resolutions, 0);
    }

    #[test]
    fn test_config_allows_override() {
        let strict = Container::new();
        strict.bind(Binding::of::<u8>().to_value(1)).unwrap();
        assert!(strict.bind(Binding::of::<u8>().to_value(2)).is_err());

        let relaxed = Container::with_config(ContainerConfig::default().with_allow_override(true));
        relaxed.bind(Binding::of::<u8>().to_value(1)).unwrap();
        relaxed.bind(Binding::of::<u8>().to_value(2)).unwrap();
        assert_eq!(*relaxed.resolve::<u8>().unwrap(), 2);
    }

    #[test]
    fn test_type_mismatch_on_named_key() {
        let container = Container::new();
        container.bind(Binding::named::<u32>("port").to_value(80)).unwrap();
        let err = container.resolve_named::<String>("port").unwrap_err();
        assert!(matches!(err, DiError::TypeMismatch { .. }));
    }

    #[test]
    fn test_try_resolve_and_nullable() {
        let container = Container::new();
        assert!(container.try_resolve::<Config>().unwrap().is_none());

        container
            .bind(Binding::of::<Config>().to_null().nullable())
            .unwrap();
        assert!(container.try_resolve::<Config>().unwrap().is_none());
        assert!(container.resolve::<Config>().unwrap_err().is_not_found());
    }

    #[test]
    fn test_override_guard_restores_binding() {
        let container = Container::new();
        container.bind(Binding::named::<String>("env").to_value("prod".to_string())).unwrap();
        assert_eq!(container.resolve_named::<String>("env").unwrap().as_str(), "prod");

        {
            let _guard = container
                .override_binding(Binding::named::<String>("env").to_value("test".to_string()))
                .unwrap();
            assert_eq!(container.resolve_named::<String>("env").unwrap().as_str(), "test");
        }
        assert_eq!(container.resolve_named::<String>("env").unwrap().as_str(), "prod");
    }

    #[test]
    fn test_override_of_unbound_key_is_removed() {
        let container = Container::new();
        let guard = container
            .override_binding(Binding::named::<u8>("flag").to_value(1))
            .unwrap();
        assert!(container.contains(guard.key()));
        drop(guard);
        assert!(!container.contains(&Key::named("flag")));
    }

    #[test]
    fn test_unbind_drops_cached_singleton() {
        let builds = Arc::new(AtomicUsize::new(0));
        let container = Container::new();
        let counter = Arc::clone(&builds);
        let binding = move || {
            let counter = Arc::clone(&counter);
            Binding::of::<u64>().to_factory(move |_| {
                Ok(counter.fetch_add(1, Ordering::SeqCst) as u64)
            })
        };

        container.bind(binding()).unwrap();
        assert_eq!(*container.resolve::<u64>().unwrap(), 0);
        assert!(container.unbind(&Key::of::<u64>()).is_some());
        assert!(container.resolve::<u64>().unwrap_err().is_not_found());

        container.bind(binding()).unwrap();
        assert_eq!(*container.resolve::<u64>().unwrap(), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_validate_on_install_rejects_broken_module() {
        let container =
            Container::with_config(ContainerConfig::default().with_validate_on_install(true));
        let module = |binder: &mut Binder<'_>| -> DiResult<()> {
            binder.bind(
                Binding::named::<u8>("svc")
                    .to_factory(|args| Ok(*args.get::<u8>("missing")?))
                    .param(Param::of::<u8>("missing")),
            )?;
            Ok(())
        };
        let err = container.install(&module).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_shutdown_releases_singleton_resources() {
        use crate::resource::Resource;

        let released = Arc::new(AtomicUsize::new(0));
        let container = Container::new();
        let flag = Arc::clone(&released);
        container
            .bind(Binding::of::<String>().to_resource(move |_| {
                let flag = Arc::clone(&flag);
                Ok(Resource::new(String::from("pool"), move |_| {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            }))
            .unwrap();

        container.resolve::<String>().unwrap();
        container.shutdown().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(container.stats().singletons, 0);
    }
}
