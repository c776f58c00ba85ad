//! Runtime object-graph resolver.
//!
//! Bindings map a [`Key`] to a construction rule and a [`Lifecycle`]. A
//! [`Container`] builds instances on demand, caches them per lifecycle, detects
//! dependency cycles and releases resources in reverse acquisition order when
//! their scope exits. Components layered on top get a start/stop lifecycle in
//! dependency order.

pub mod binding;
pub mod component;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod invoke;
pub mod key;
pub mod lazy;
pub mod module;
pub mod registry;
mod resolver;
pub mod resource;
pub mod scope;
pub mod validation;

use std::sync::Arc;

pub use binding::{Args, Binding, BindingBuilder, Injectable, Lifecycle, Param, TargetKind, TypedBinding};
pub use component::{Component, ComponentConfig, ComponentRegistry, ComponentSpec, ComponentState};
pub use config::{ContainerConfig, DEFAULT_ENV_PREFIX};
pub use container::{Container, ContainerStats, OverrideGuard};
pub use context::{clear_default, default_container, install_default, ActiveContext, ContextGuard, Snapshot};
pub use error::{CleanupFailure, DiError, DiResult};
pub use invoke::{Arguments, Invocable};
pub use key::Key;
pub use lazy::Lazy;
pub use module::{Binder, Module, ValuesModule};
pub use registry::Registry;
pub use resource::{AsyncResource, Resource};
pub use scope::{ScopeContext, ScopeGuard};
pub use validation::{DependencyGraph, DependencyGraphStats, Edge};

/// Resolves `T` against the active container of the current task or thread,
/// falling back to the process-wide default.
pub fn resolve<T: ?Sized + Send + Sync + 'static>() -> DiResult<Arc<T>> {
    ActiveContext::get_active(None)
        .ok_or(DiError::NoActiveContainer)?
        .resolve::<T>()
}

pub async fn resolve_async<T: ?Sized + Send + Sync + 'static>() -> DiResult<Arc<T>> {
    let container = ActiveContext::get_active(None).ok_or(DiError::NoActiveContainer)?;
    container.resolve_async::<T>().await
}
