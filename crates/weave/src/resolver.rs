//! Dependency resolution.
//!
//! A [`Resolver`] walks the declared parameters of a binding, resolves each one
//! recursively while tracking the chain of keys being built, and hands the final
//! construction to the instance cache that owns the binding's lifecycle.
//! Dependencies are always resolved before the owning cache slot is claimed, so a
//! slot is never held while another slot is being filled.
//!
//! Constructors run with their dependency path recorded in the context, and every
//! top-level resolution starts from that path.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::binding::{Args, Binding, Lifecycle, Param, Target};
use crate::container::Container;
use crate::context;
use crate::error::{DiError, DiResult};
use crate::invoke::Arguments;
use crate::key::Key;
use crate::lazy::LazyHandle;
use crate::resource::{erase, Constructed, Instance, ResourceHandle, ResourceStack};
use crate::scope::{InstanceCache, ScopeContext};

/// How a single parameter will be satisfied.
enum Planned {
    Explicit(Instance),
    Binding(Key),
    Default(Instance),
    Absent,
}

/// Where an instance is cached and whose exit releases its resources.
enum Owner {
    Root,
    Scope(Arc<ScopeContext>),
    Transient,
}

pub(crate) struct Resolver<'c> {
    container: &'c Container,
    explicit: Vec<Arc<ScopeContext>>,
}

fn extend(chain: &[Key], key: &Key) -> Vec<Key> {
    let mut path = Vec::with_capacity(chain.len() + 1);
    path.extend_from_slice(chain);
    path.push(key.clone());
    path
}

impl<'c> Resolver<'c> {
    pub fn new(container: &'c Container, explicit: Vec<Arc<ScopeContext>>) -> Self {
        let explicit = explicit
            .into_iter()
            .filter(|scope| scope.container_id() == container.id())
            .collect();
        Self {
            container,
            explicit,
        }
    }

    /// Open scopes visible to this resolution, innermost first.
    fn scopes(&self) -> Vec<Arc<ScopeContext>> {
        let mut scopes: Vec<_> = self
            .explicit
            .iter()
            .filter(|scope| !scope.is_closed())
            .cloned()
            .collect();
        scopes.extend(context::visible_scopes(self.container.id()));
        scopes
    }

    fn find_scope(&self, name: &str) -> Option<Arc<ScopeContext>> {
        self.scopes().into_iter().find(|scope| scope.name() == name)
    }

    fn owner_for(&self, binding: &Binding, path: &[Key]) -> DiResult<Owner> {
        match binding.lifecycle() {
            Lifecycle::Singleton => Ok(Owner::Root),
            Lifecycle::Transient => Ok(Owner::Transient),
            Lifecycle::Scoped(name) => self
                .find_scope(name)
                .map(Owner::Scope)
                .ok_or_else(|| DiError::Scope {
                    key: binding.key().clone(),
                    scope: name.to_string(),
                    path: path.to_vec(),
                }),
        }
    }

    fn cache_of<'a>(&'a self, owner: &'a Owner) -> Option<&'a InstanceCache> {
        match owner {
            Owner::Root => Some(self.container.singletons()),
            Owner::Scope(scope) => Some(&scope.cache),
            Owner::Transient => None,
        }
    }

    /// Finalizers of singletons belong to the container, of scoped instances to
    /// their scope, and of transients to the innermost open scope.
    fn resources_of(&self, owner: &Owner) -> Arc<ResourceStack> {
        match owner {
            Owner::Root => self.container.root_resources(),
            Owner::Scope(scope) => Arc::clone(&scope.resources),
            Owner::Transient => self
                .scopes()
                .first()
                .map(|scope| Arc::clone(&scope.resources))
                .unwrap_or_else(|| self.container.root_resources()),
        }
    }

    fn lookup(&self, key: &Key, parameter: Option<&str>, path: &[Key]) -> DiResult<Binding> {
        self.container
            .registry()
            .lookup(key)
            .ok_or_else(|| DiError::not_found(key, parameter, path))
    }

    /// Hands the finalizer to its owner. An owner released while the constructor
    /// was running refuses it; the finalizer then runs at once and the instance is
    /// not handed out.
    fn adopt(
        &self,
        key: &Key,
        constructed: Constructed,
        resources: &ResourceStack,
        path: &[Key],
    ) -> DiResult<Instance> {
        if let Some(release) = constructed.release {
            if let Err(refused) = resources.push(ResourceHandle::new(key.clone(), release)) {
                refused.discard();
                return Err(DiError::Scope {
                    key: key.clone(),
                    scope: resources.owner().to_string(),
                    path: path.to_vec(),
                });
            }
        }
        self.container.counters().constructed();
        Ok(constructed.instance)
    }

    fn plan_param(&self, param: &Param, explicit: Option<&Instance>) -> Option<Planned> {
        if let Some(value) = explicit {
            return Some(Planned::Explicit(Arc::clone(value)));
        }
        let registry = self.container.registry();
        if let Some(key) = param
            .candidate_keys()
            .into_iter()
            .find(|key| registry.contains(key))
        {
            return Some(Planned::Binding(key));
        }
        if let Some(default) = param.default_instance() {
            return Some(Planned::Default(Arc::clone(default)));
        }
        if param.is_optional() {
            return Some(Planned::Absent);
        }
        None
    }

    fn missing_param(&self, param: &Param, path: &[Key]) -> DiError {
        let expected = param.expected_key();
        DiError::not_found(&expected, Some(param.name()), &extend(path, &expected))
    }

    fn lazy_handle(&self, key: Key) -> Instance {
        erase(Arc::new(LazyHandle::new(self.container, key, &self.scopes())))
    }

    fn build_args(
        &self,
        binding: &Binding,
        path: &[Key],
        explicit: &HashMap<String, Instance>,
    ) -> DiResult<Args> {
        let mut args = Args::default();
        for param in binding.params() {
            let planned = self
                .plan_param(param, explicit.get(param.name()))
                .ok_or_else(|| self.missing_param(param, path))?;
            match planned {
                Planned::Explicit(value) | Planned::Default(value) => {
                    args.insert(param.name(), value)
                }
                Planned::Binding(key) if param.is_lazy() => {
                    args.insert(param.name(), self.lazy_handle(key))
                }
                Planned::Binding(key) => {
                    if let Some(value) = self.resolve_chain(&key, path, Some(param.name()))? {
                        args.insert(param.name(), value);
                    }
                }
                Planned::Absent => {}
            }
        }
        Ok(args)
    }

    async fn build_args_async(
        &self,
        binding: &Binding,
        path: &[Key],
        explicit: &HashMap<String, Instance>,
    ) -> DiResult<Args> {
        let mut args = Args::default();
        for param in binding.params() {
            let planned = self
                .plan_param(param, explicit.get(param.name()))
                .ok_or_else(|| self.missing_param(param, path))?;
            match planned {
                Planned::Explicit(value) | Planned::Default(value) => {
                    args.insert(param.name(), value)
                }
                Planned::Binding(key) if param.is_lazy() => {
                    args.insert(param.name(), self.lazy_handle(key))
                }
                Planned::Binding(key) => {
                    let resolved = self
                        .resolve_chain_async(key, path.to_vec(), Some(param.name().to_string()))
                        .await?;
                    if let Some(value) = resolved {
                        args.insert(param.name(), value);
                    }
                }
                Planned::Absent => {}
            }
        }
        Ok(args)
    }

    /// Resolves `key`; `None` when it is bound to an explicit null.
    pub fn resolve_optional(&self, key: &Key) -> DiResult<Option<Instance>> {
        self.container.counters().requested();
        self.resolve_chain(key, &context::construction_path(), None).map_err(|e| {
            self.container.counters().failed();
            e
        })
    }

    pub fn resolve_required(&self, key: &Key) -> DiResult<Instance> {
        self.resolve_optional(key)?
            .ok_or_else(|| DiError::not_found(key, None, std::slice::from_ref(key)))
    }

    fn resolve_chain(
        &self,
        key: &Key,
        chain: &[Key],
        parameter: Option<&str>,
    ) -> DiResult<Option<Instance>> {
        if chain.contains(key) {
            return Err(DiError::CircularDependency {
                path: extend(chain, key),
            });
        }
        let path = extend(chain, key);
        let binding = self.lookup(key, parameter, &path)?;
        if binding.is_async() {
            return Err(DiError::AsyncResolution {
                key: key.clone(),
                path,
            });
        }

        let owner = self.owner_for(&binding, &path)?;
        let ctor = match binding.target() {
            Target::Null => return Ok(None),
            Target::Instance(instance) => return Ok(Some(Arc::clone(instance))),
            Target::Sync(ctor) => Arc::clone(ctor),
            Target::Async(_) => {
                return Err(DiError::AsyncResolution {
                    key: key.clone(),
                    path,
                })
            }
        };

        let cache = self.cache_of(&owner);
        if let Some(hit) = cache.and_then(|cache| cache.get(key)) {
            trace!(key = %key, "Cache hit");
            self.container.counters().hit();
            return Ok(Some(hit));
        }

        let args = self.build_args(&binding, &path, &HashMap::new())?;
        let resources = self.resources_of(&owner);
        let construct = || -> DiResult<Instance> {
            debug!(key = %key, lifecycle = %binding.lifecycle(), "Constructing instance");
            let constructed = context::constructing(&path, || ctor(&args))
                .map_err(|e| DiError::from_factory(key, &path, e))?;
            self.adopt(key, constructed, &resources, &path)
        };

        let instance = match cache {
            Some(cache) => cache.get_or_create(key, chain, construct)?,
            None => construct()?,
        };
        Ok(Some(instance))
    }

    pub async fn resolve_optional_async(&self, key: &Key) -> DiResult<Option<Instance>> {
        self.container.counters().requested();
        self.resolve_chain_async(key.clone(), context::construction_path(), None)
            .await
            .map_err(|e| {
                self.container.counters().failed();
                e
            })
    }

    pub async fn resolve_required_async(&self, key: &Key) -> DiResult<Instance> {
        self.resolve_optional_async(key)
            .await?
            .ok_or_else(|| DiError::not_found(key, None, std::slice::from_ref(key)))
    }

    fn resolve_chain_async<'a>(
        &'a self,
        key: Key,
        chain: Vec<Key>,
        parameter: Option<String>,
    ) -> BoxFuture<'a, DiResult<Option<Instance>>> {
        async move {
            if chain.contains(&key) {
                return Err(DiError::CircularDependency {
                    path: extend(&chain, &key),
                });
            }
            let path = extend(&chain, &key);
            let binding = self.lookup(&key, parameter.as_deref(), &path)?;
            let owner = self.owner_for(&binding, &path)?;

            match binding.target() {
                Target::Null => return Ok(None),
                Target::Instance(instance) => return Ok(Some(Arc::clone(instance))),
                Target::Sync(_) | Target::Async(_) => {}
            }

            let cache = self.cache_of(&owner);
            if let Some(hit) = cache.and_then(|cache| cache.get(&key)) {
                trace!(key = %key, "Cache hit");
                self.container.counters().hit();
                return Ok(Some(hit));
            }

            let args = self
                .build_args_async(&binding, &path, &HashMap::new())
                .await?;
            let resources = self.resources_of(&owner);
            let construct = self.construct_async(&key, &binding, args, &path, &resources);

            let instance = match cache {
                Some(cache) => cache.get_or_create_async(&key, construct).await?,
                None => construct.await?,
            };
            Ok(Some(instance))
        }
        .boxed()
    }

    async fn construct_async(
        &self,
        key: &Key,
        binding: &Binding,
        args: Args,
        path: &[Key],
        resources: &ResourceStack,
    ) -> DiResult<Instance> {
        debug!(key = %key, lifecycle = %binding.lifecycle(), "Constructing instance");
        let constructed = match binding.target() {
            Target::Sync(ctor) => context::constructing(path, || ctor(&args)),
            Target::Async(ctor) => context::constructing_async(path.to_vec(), ctor(args)).await,
            Target::Instance(instance) => Ok(Constructed::plain(Arc::clone(instance))),
            Target::Null => return Err(DiError::not_found(key, None, path)),
        }
        .map_err(|e| DiError::from_factory(key, path, e))?;
        self.adopt(key, constructed, resources, path)
    }

    /// Runs the binding's constructor with explicit arguments. The result is never
    /// cached; resources it creates belong to the innermost open scope.
    pub fn invoke(&self, binding: &Binding, explicit: &Arguments) -> DiResult<Instance> {
        let key = binding.key();
        let path = extend(&context::construction_path(), key);
        let matched = explicit.match_params(key, binding.params())?;

        let ctor = match binding.target() {
            Target::Sync(ctor) => Arc::clone(ctor),
            Target::Async(_) => {
                return Err(DiError::AsyncResolution {
                    key: key.clone(),
                    path,
                })
            }
            Target::Instance(instance) => return Ok(Arc::clone(instance)),
            Target::Null => return Err(DiError::not_found(key, None, &path)),
        };

        let args = self.build_args(binding, &path, &matched)?;
        let resources = self.resources_of(&Owner::Transient);
        let constructed = context::constructing(&path, || ctor(&args))
            .map_err(|e| DiError::from_factory(key, &path, e))?;
        self.adopt(key, constructed, &resources, &path)
    }

    pub async fn invoke_async(
        &self,
        binding: &Binding,
        explicit: &Arguments,
    ) -> DiResult<Instance> {
        let key = binding.key();
        let path = extend(&context::construction_path(), key);
        let matched = explicit.match_params(key, binding.params())?;
        let args = self.build_args_async(binding, &path, &matched).await?;
        let resources = self.resources_of(&Owner::Transient);
        self.construct_async(key, binding, args, &path, &resources)
            .await
    }
}
