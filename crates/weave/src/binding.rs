//! Binding declarations.
//!
//! A binding maps a [`Key`] to a construction strategy, a [`Lifecycle`] and the
//! list of [`Param`]s its constructor consumes. Bindings are validated when they
//! are built and are immutable once stored in the registry.

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::lazy::{Lazy, LazyHandle};
use crate::resource::{downcast, erase, AsyncResource, Constructed, Instance, Resource};

/// How long a constructed instance lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Lifecycle {
    /// One instance per container, constructed on first use.
    #[default]
    Singleton,
    /// A new instance on every resolution.
    Transient,
    /// One instance per active scope with the given name.
    Scoped(Cow<'static, str>),
}

impl Lifecycle {
    pub fn scoped(name: impl Into<Cow<'static, str>>) -> Self {
        Lifecycle::Scoped(name.into())
    }

    pub fn scope_name(&self) -> Option<&str> {
        match self {
            Lifecycle::Scoped(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Singleton => f.write_str("singleton"),
            Lifecycle::Transient => f.write_str("transient"),
            Lifecycle::Scoped(name) => write!(f, "scoped({})", name),
        }
    }
}

/// Kind of target a binding points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Instance,
    Class,
    Factory,
    AsyncFactory,
    Resource,
    AsyncResource,
    Null,
}

impl TargetKind {
    pub fn is_async(self) -> bool {
        matches!(self, TargetKind::AsyncFactory | TargetKind::AsyncResource)
    }
}

fn primitive_type_ids() -> [TypeId; 19] {
    [
        TypeId::of::<String>(),
        TypeId::of::<&'static str>(),
        TypeId::of::<str>(),
        TypeId::of::<bool>(),
        TypeId::of::<char>(),
        TypeId::of::<i8>(),
        TypeId::of::<i16>(),
        TypeId::of::<i32>(),
        TypeId::of::<i64>(),
        TypeId::of::<i128>(),
        TypeId::of::<isize>(),
        TypeId::of::<u8>(),
        TypeId::of::<u16>(),
        TypeId::of::<u32>(),
        TypeId::of::<u64>(),
        TypeId::of::<u128>(),
        TypeId::of::<usize>(),
        TypeId::of::<f32>(),
        TypeId::of::<f64>(),
    ]
}

fn is_primitive<T: ?Sized + 'static>() -> bool {
    primitive_type_ids().contains(&TypeId::of::<T>())
}

/// A declared constructor parameter.
///
/// Resolution order for a parameter: explicit invocation argument, the key set with
/// [`Param::from_key`], a binding named exactly like the parameter, a binding of the
/// declared type (never for primitives), the declared default, and finally absence
/// when the parameter is optional.
#[derive(Clone)]
pub struct Param {
    name: Cow<'static, str>,
    type_key: Option<Key>,
    type_name: &'static str,
    primitive: bool,
    default: Option<Instance>,
    optional: bool,
    lazy: bool,
    bound: Option<Key>,
}

impl Param {
    /// Parameter of type `T`.
    pub fn of<T: ?Sized + Send + Sync + 'static>(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            type_key: Some(Key::of::<T>()),
            type_name: type_name::<T>(),
            primitive: is_primitive::<T>(),
            default: None,
            optional: false,
            lazy: false,
            bound: None,
        }
    }

    /// Parameter without a declared type; only explicit arguments, a binding with
    /// the same name or a default can satisfy it.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            type_key: None,
            type_name: "_",
            primitive: false,
            default: None,
            optional: false,
            lazy: false,
            bound: None,
        }
    }

    /// Parameter receiving a [`Lazy<T>`] handle instead of the instance itself.
    /// Lazy edges do not count towards cycle detection.
    pub fn lazy<T: ?Sized + Send + Sync + 'static>(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            lazy: true,
            ..Self::of::<T>(name)
        }
    }

    pub fn default_value<V: Send + Sync + 'static>(self, value: V) -> Self {
        self.default_shared(Arc::new(value))
    }

    pub fn default_shared<V: ?Sized + Send + Sync + 'static>(mut self, value: Arc<V>) -> Self {
        self.default = Some(erase(value));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Never resolve this parameter by its type.
    pub fn primitive(mut self) -> Self {
        self.primitive = true;
        self
    }

    /// Resolve this parameter from an explicit key first.
    pub fn from_key(mut self, key: impl Into<Key>) -> Self {
        self.bound = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_key(&self) -> Option<&Key> {
        self.type_key.as_ref()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn bound_key(&self) -> Option<&Key> {
        self.bound.as_ref()
    }

    pub(crate) fn default_instance(&self) -> Option<&Instance> {
        self.default.as_ref()
    }

    /// Key reported when the parameter cannot be satisfied.
    pub(crate) fn expected_key(&self) -> Key {
        self.bound
            .as_ref()
            .or(self.type_key.as_ref().filter(|_| !self.primitive))
            .cloned()
            .unwrap_or_else(|| Key::named(self.name.clone()))
    }

    /// Candidate keys in lookup order: bound key, parameter name, declared type.
    pub(crate) fn candidate_keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(3);
        if let Some(bound) = &self.bound {
            keys.push(bound.clone());
        }
        keys.push(Key::named(self.name.clone()));
        if !self.primitive {
            if let Some(type_key) = &self.type_key {
                keys.push(type_key.clone());
            }
        }
        keys
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("primitive", &self.primitive)
            .field("optional", &self.optional)
            .field("lazy", &self.lazy)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Values handed to a constructor, keyed by parameter name.
#[derive(Clone, Default)]
pub struct Args {
    values: HashMap<String, Instance>,
}

impl Args {
    pub(crate) fn insert(&mut self, name: &str, value: Instance) {
        self.values.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The value for `name`. Fails with `DependencyNotFound` when the parameter
    /// was left absent and `TypeMismatch` when it holds another type.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> DiResult<Arc<T>> {
        match self.optional::<T>(name)? {
            Some(value) => Ok(value),
            None => Err(DiError::not_found(&Key::named(name.to_string()), Some(name), &[])),
        }
    }

    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, name: &str) -> DiResult<T> {
        self.get::<T>(name).map(|value| (*value).clone())
    }

    pub fn optional<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> DiResult<Option<Arc<T>>> {
        match self.values.get(name) {
            None => Ok(None),
            Some(instance) => downcast::<T>(instance).map(Some).ok_or_else(|| {
                DiError::TypeMismatch {
                    key: Key::named(name.to_string()),
                    expected: type_name::<T>(),
                }
            }),
        }
    }

    pub fn lazy<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> DiResult<Lazy<T>> {
        let handle = self.get::<LazyHandle>(name)?;
        Ok(Lazy::new(handle))
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Args").field("names", &names).finish()
    }
}

/// A type that declares its own constructor parameters.
pub trait Injectable: Sized + Send + Sync + 'static {
    fn parameters() -> Vec<Param> {
        Vec::new()
    }

    fn construct(args: &Args) -> anyhow::Result<Self>;
}

pub(crate) type SyncCtor = Arc<dyn Fn(&Args) -> anyhow::Result<Constructed> + Send + Sync>;
pub(crate) type AsyncCtor =
    Arc<dyn Fn(Args) -> BoxFuture<'static, anyhow::Result<Constructed>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Target {
    Instance(Instance),
    Sync(SyncCtor),
    Async(AsyncCtor),
    Null,
}

/// A validated binding as stored in the registry.
#[derive(Clone)]
pub struct Binding {
    key: Key,
    target: Target,
    kind: TargetKind,
    lifecycle: Lifecycle,
    nullable: bool,
    allow_override: bool,
    params: Vec<Param>,
    type_name: &'static str,
}

impl Binding {
    /// Starts a binding keyed by the type `T`.
    pub fn of<T: ?Sized + Send + Sync + 'static>() -> TypedBinding<T> {
        TypedBinding::new(Key::of::<T>())
    }

    /// Starts a binding keyed by `name` that produces values of type `T`.
    pub fn named<T: ?Sized + Send + Sync + 'static>(
        name: impl Into<Cow<'static, str>>,
    ) -> TypedBinding<T> {
        TypedBinding::new(Key::named(name))
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_async(&self) -> bool {
        self.kind.is_async()
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn allows_override(&self) -> bool {
        self.allow_override
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Name of the type the binding produces.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    /// Singleton binding of an already erased value.
    pub(crate) fn erased_instance(key: Key, instance: Instance, type_name: &'static str) -> Self {
        Self {
            key,
            target: Target::Instance(instance),
            kind: TargetKind::Instance,
            lifecycle: Lifecycle::Singleton,
            nullable: false,
            allow_override: false,
            params: Vec::new(),
            type_name,
        }
    }

    pub(crate) fn push_param(&mut self, param: Param) {
        self.params.push(param);
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("lifecycle", &self.lifecycle)
            .field("nullable", &self.nullable)
            .field("params", &self.params)
            .finish()
    }
}

/// First stage of a binding: the key and produced type are known, the target is not.
pub struct TypedBinding<T: ?Sized> {
    key: Key,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> TypedBinding<T> {
    fn new(key: Key) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    fn with_target(self, target: Target, kind: TargetKind) -> BindingBuilder {
        let mut builder = BindingBuilder::abstract_binding(self.key, type_name::<T>());
        builder.target = Some((target, kind));
        builder
    }

    /// Binds a pre-built instance.
    pub fn to_instance(self, instance: Arc<T>) -> BindingBuilder {
        self.with_target(Target::Instance(erase(instance)), TargetKind::Instance)
    }

    /// Binds a factory returning an already shared value; usable for `dyn Trait` keys.
    pub fn to_shared_factory<F>(self, factory: F) -> BindingBuilder
    where
        F: Fn(&Args) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let ctor: SyncCtor = Arc::new(move |args: &Args| {
            factory(args).map(|value| Constructed::plain(erase(value)))
        });
        self.with_target(Target::Sync(ctor), TargetKind::Factory)
    }

    pub fn to_async_shared_factory<F, Fut>(self, factory: F) -> BindingBuilder
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let ctor: AsyncCtor = Arc::new(move |args: Args| {
            factory(args)
                .map(|result| result.map(|value| Constructed::plain(erase(value))))
                .boxed()
        });
        self.with_target(Target::Async(ctor), TargetKind::AsyncFactory)
    }

    /// Binds a factory whose output carries a release callback.
    pub fn to_resource<F>(self, factory: F) -> BindingBuilder
    where
        F: Fn(&Args) -> anyhow::Result<Resource<T>> + Send + Sync + 'static,
    {
        let ctor: SyncCtor =
            Arc::new(move |args: &Args| factory(args).map(Resource::into_constructed));
        self.with_target(Target::Sync(ctor), TargetKind::Resource)
    }

    pub fn to_async_resource<F, Fut>(self, factory: F) -> BindingBuilder
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<AsyncResource<T>>> + Send + 'static,
    {
        let ctor: AsyncCtor = Arc::new(move |args: Args| {
            factory(args)
                .map(|result| result.map(AsyncResource::into_constructed))
                .boxed()
        });
        self.with_target(Target::Async(ctor), TargetKind::AsyncResource)
    }

    /// Binds an explicit absence. Requires [`BindingBuilder::nullable`].
    pub fn to_null(self) -> BindingBuilder {
        self.with_target(Target::Null, TargetKind::Null)
    }
}

impl<T: Send + Sync + 'static> TypedBinding<T> {
    pub fn to_value(self, value: T) -> BindingBuilder {
        self.to_instance(Arc::new(value))
    }

    pub fn to_factory<F>(self, factory: F) -> BindingBuilder
    where
        F: Fn(&Args) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.to_shared_factory(move |args| factory(args).map(Arc::new))
    }

    pub fn to_async_factory<F, Fut>(self, factory: F) -> BindingBuilder
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.to_async_shared_factory(move |args| factory(args).map(|result| result.map(Arc::new)))
    }
}

impl<T: Injectable> TypedBinding<T> {
    /// Binds the type's own constructor and declared parameters.
    pub fn to_class(self) -> BindingBuilder {
        let ctor: SyncCtor = Arc::new(|args: &Args| {
            T::construct(args).map(|value| Constructed::plain(erase(Arc::new(value))))
        });
        let mut builder = self.with_target(Target::Sync(ctor), TargetKind::Class);
        builder.params = T::parameters();
        builder
    }
}

impl<T: ?Sized + Send + Sync + 'static> From<TypedBinding<T>> for BindingBuilder {
    /// A binding without a target. `build` rejects it.
    fn from(typed: TypedBinding<T>) -> Self {
        BindingBuilder::abstract_binding(typed.key, type_name::<T>())
    }
}

/// Second stage: target chosen, lifecycle and parameters being configured.
pub struct BindingBuilder {
    key: Key,
    target: Option<(Target, TargetKind)>,
    lifecycle: Lifecycle,
    nullable: bool,
    allow_override: bool,
    params: Vec<Param>,
    type_name: &'static str,
}

impl BindingBuilder {
    fn abstract_binding(key: Key, type_name: &'static str) -> Self {
        Self {
            key,
            target: None,
            lifecycle: Lifecycle::default(),
            nullable: false,
            allow_override: false,
            params: Vec::new(),
            type_name,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn singleton(self) -> Self {
        self.lifecycle(Lifecycle::Singleton)
    }

    pub fn transient(self) -> Self {
        self.lifecycle(Lifecycle::Transient)
    }

    pub fn scoped(self, scope: impl Into<Cow<'static, str>>) -> Self {
        self.lifecycle(Lifecycle::scoped(scope))
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn allow_override(mut self) -> Self {
        self.allow_override = true;
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn build(self) -> DiResult<Binding> {
        let Some((target, kind)) = self.target else {
            return Err(DiError::binding(
                &self.key,
                "abstract binding has no constructible target; provide a factory or instance",
            ));
        };

        if kind == TargetKind::Null && !self.nullable {
            return Err(DiError::binding(
                &self.key,
                "null target requires a nullable binding",
            ));
        }

        if matches!(kind, TargetKind::Instance | TargetKind::Null) && !self.params.is_empty() {
            return Err(DiError::binding(
                &self.key,
                "instance bindings cannot declare parameters",
            ));
        }

        let mut seen = HashSet::new();
        for param in &self.params {
            if !seen.insert(param.name()) {
                return Err(DiError::binding(
                    &self.key,
                    format!("parameter '{}' declared twice", param.name()),
                ));
            }
        }

        Ok(Binding {
            key: self.key,
            target,
            kind,
            lifecycle: self.lifecycle,
            nullable: self.nullable,
            allow_override: self.allow_override,
            params: self.params,
            type_name: self.type_name,
        })
    }
}

impl BindingBuilder {
    /// Unvalidated transient binding used for ad-hoc invocations.
    pub(crate) fn into_adhoc(self) -> Binding {
        let (target, kind) = self.target.unwrap_or((Target::Null, TargetKind::Null));
        Binding {
            key: self.key,
            target,
            kind,
            lifecycle: Lifecycle::Transient,
            nullable: kind == TargetKind::Null,
            allow_override: false,
            params: self.params,
            type_name: self.type_name,
        }
    }
}

impl TryFrom<BindingBuilder> for Binding {
    type Error = DiError;

    fn try_from(builder: BindingBuilder) -> DiResult<Self> {
        builder.build()
    }
}
