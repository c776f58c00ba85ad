//! Hybrid invocation: explicit call arguments mixed with resolved dependencies.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::binding::{Args, Binding, Param};
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::resource::{erase, Instance};

/// Explicit arguments for [`Container::invoke`](crate::Container::invoke).
///
/// Positional values bind to declared parameters in order; keyword values bind by
/// name. Anything left over is an error.
#[derive(Clone, Default)]
pub struct Arguments {
    positional: Vec<Instance>,
    named: Vec<(String, Instance)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<V: Send + Sync + 'static>(self, value: V) -> Self {
        self.arg_shared(Arc::new(value))
    }

    pub fn arg_shared<V: ?Sized + Send + Sync + 'static>(mut self, value: Arc<V>) -> Self {
        self.positional.push(erase(value));
        self
    }

    pub fn named<V: Send + Sync + 'static>(self, name: impl Into<String>, value: V) -> Self {
        self.named_shared(name, Arc::new(value))
    }

    pub fn named_shared<V: ?Sized + Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        value: Arc<V>,
    ) -> Self {
        self.named.push((name.into(), erase(value)));
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Assigns every explicit value to a declared parameter of `key`.
    pub(crate) fn match_params(&self, key: &Key, params: &[Param]) -> DiResult<HashMap<String, Instance>> {
        let invalid = |reason: String| DiError::Invocation {
            key: key.clone(),
            reason,
        };

        let mut declared = HashSet::new();
        for param in params {
            if !declared.insert(param.name()) {
                return Err(invalid(format!("parameter '{}' declared twice", param.name())));
            }
        }

        if self.positional.len() > params.len() {
            return Err(invalid(format!(
                "takes {} argument(s) but {} positional were given",
                params.len(),
                self.positional.len()
            )));
        }

        let mut matched: HashMap<String, Instance> = params
            .iter()
            .zip(&self.positional)
            .map(|(param, value)| (param.name().to_string(), Arc::clone(value)))
            .collect();

        for (name, value) in &self.named {
            if !declared.contains(name.as_str()) {
                return Err(invalid(format!("unexpected keyword argument '{}'", name)));
            }
            if matched.insert(name.clone(), Arc::clone(value)).is_some() {
                return Err(invalid(format!("multiple values for argument '{}'", name)));
            }
        }

        Ok(matched)
    }
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.named.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("Arguments")
            .field("positional", &self.positional.len())
            .field("named", &names)
            .finish()
    }
}

/// A callable that is not stored in the registry but is invoked with the same
/// parameter rules as registered factories. Never cached.
pub struct Invocable<R: ?Sized> {
    binding: Binding,
    _marker: PhantomData<fn() -> Arc<R>>,
}

impl<R: Send + Sync + 'static> Invocable<R> {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::from_binding(Binding::named::<R>(name).to_factory(f).into_adhoc())
    }

    pub fn new_async<F, Fut>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::from_binding(Binding::named::<R>(name).to_async_factory(f).into_adhoc())
    }
}

impl<R: ?Sized + Send + Sync + 'static> Invocable<R> {
    fn from_binding(binding: Binding) -> Self {
        Self {
            binding,
            _marker: PhantomData,
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.binding.push_param(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        for param in params {
            self.binding.push_param(param);
        }
        self
    }

    pub fn name(&self) -> &Key {
        self.binding.key()
    }

    pub fn is_async(&self) -> bool {
        self.binding.is_async()
    }

    pub(crate) fn binding(&self) -> &Binding {
        &self.binding
    }
}
