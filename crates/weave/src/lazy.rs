use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::container::{Container, ContainerInner};
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::resolver::Resolver;
use crate::resource::{downcast, Instance};
use crate::scope::ScopeContext;

/// Deferred resolution target injected for lazy parameters.
///
/// Holds the container weakly so a lazy edge never keeps the container alive, and
/// remembers the scopes that were active when it was injected.
pub(crate) struct LazyHandle {
    container: Weak<ContainerInner>,
    key: Key,
    scopes: Vec<Weak<ScopeContext>>,
}

impl LazyHandle {
    pub fn new(container: &Container, key: Key, scopes: &[Arc<ScopeContext>]) -> Self {
        Self {
            container: container.downgrade(),
            key,
            scopes: scopes.iter().map(Arc::downgrade).collect(),
        }
    }

    fn attach(&self) -> DiResult<(Container, Vec<Arc<ScopeContext>>)> {
        let inner = self.container.upgrade().ok_or_else(|| DiError::Detached {
            key: self.key.clone(),
        })?;
        let scopes = self
            .scopes
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|scope| !scope.is_closed())
            .collect();
        Ok((Container::from_inner(inner), scopes))
    }

    fn resolve(&self) -> DiResult<Instance> {
        let (container, scopes) = self.attach()?;
        Resolver::new(&container, scopes).resolve_required(&self.key)
    }

    async fn resolve_async(&self) -> DiResult<Instance> {
        let (container, scopes) = self.attach()?;
        Resolver::new(&container, scopes)
            .resolve_required_async(&self.key)
            .await
    }
}

/// A dependency that is resolved on use rather than at injection time.
///
/// Declared with [`Param::lazy`](crate::Param::lazy) and read with
/// [`Args::lazy`](crate::Args::lazy). This is the supported way to close a
/// dependency cycle.
pub struct Lazy<T: ?Sized> {
    handle: Arc<LazyHandle>,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Lazy<T> {
    pub(crate) fn new(handle: Arc<LazyHandle>) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &Key {
        &self.handle.key
    }

    pub fn get(&self) -> DiResult<Arc<T>> {
        let instance = self.handle.resolve()?;
        self.cast(&instance)
    }

    pub async fn get_async(&self) -> DiResult<Arc<T>> {
        let instance = self.handle.resolve_async().await?;
        self.cast(&instance)
    }

    fn cast(&self, instance: &Instance) -> DiResult<Arc<T>> {
        downcast::<T>(instance).ok_or_else(|| DiError::TypeMismatch {
            key: self.handle.key.clone(),
            expected: type_name::<T>(),
        })
    }
}

impl<T: ?Sized> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lazy({})", self.handle.key)
    }
}
