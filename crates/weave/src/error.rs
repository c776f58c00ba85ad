//! Error taxonomy of the resolver.
//!
//! Every error raised while resolving carries the dependency path that produced it,
//! so `DependencyNotFound` for `Database` reached through `UserService` reads
//! `... (via UserService -> Database)`. Errors are `Clone` because a failed
//! single-flight construction hands the same error to every waiting caller.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::key::{format_path, Key};

pub type DiResult<T> = Result<T, DiError>;

/// One finalizer that failed while a scope was being torn down.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub key: Key,
    pub message: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

#[derive(Debug, Error, Clone)]
pub enum DiError {
    /// Invalid binding declaration (abstract target, null target, bad parameters).
    #[error("invalid binding for {key}: {reason}")]
    Binding { key: Key, reason: String },

    /// The key is already bound and overriding was not enabled.
    #[error("{key} is already registered")]
    AlreadyRegistered { key: Key },

    /// No binding, no default and not optional.
    #[error("no binding found for {key}{}{}", parameter_suffix(.parameter), trail(.path))]
    DependencyNotFound {
        key: Key,
        parameter: Option<String>,
        path: Vec<Key>,
    },

    #[error("circular dependency detected: {}", format_path(.path))]
    CircularDependency { path: Vec<Key> },

    /// A scoped binding was requested outside of any matching active scope.
    #[error("scope '{scope}' is not active while resolving {key}{}", trail(.path))]
    Scope {
        key: Key,
        scope: String,
        path: Vec<Key>,
    },

    #[error("{key} is bound to an async factory; use resolve_async{}", trail(.path))]
    AsyncResolution { key: Key, path: Vec<Key> },

    #[error(
        "{} resource finalizer(s) failed while exiting scope '{scope}': {}",
        .failures.len(),
        join_failures(.failures)
    )]
    ResourceCleanup {
        scope: String,
        failures: Vec<CleanupFailure>,
    },

    /// A user factory returned an error.
    #[error("failed to construct {key}{}: {source}", trail(.path))]
    Construction {
        key: Key,
        path: Vec<Key>,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("{key} does not hold a value of type {expected}")]
    TypeMismatch { key: Key, expected: &'static str },

    #[error("invalid invocation of {key}: {reason}")]
    Invocation { key: Key, reason: String },

    /// Registration, lifecycle transition or hook failure of a component.
    #[error("component '{name}': {reason}")]
    Component { name: String, reason: String },

    /// Free-function resolution found neither an entered container nor a default.
    #[error("no active container; enter a scope, activate a container or install a default")]
    NoActiveContainer,

    /// A lazy handle outlived the container that issued it.
    #[error("container owning {key} has been dropped")]
    Detached { key: Key },
}

impl DiError {
    /// Wraps a factory failure. Errors that already are `DiError` pass through;
    /// a missing argument reported by `Args::get` gains the factory's path.
    pub(crate) fn from_factory(key: &Key, path: &[Key], err: anyhow::Error) -> Self {
        match err.downcast::<DiError>() {
            Ok(DiError::DependencyNotFound {
                key: missing,
                parameter,
                path: inner,
            }) if inner.is_empty() => {
                let mut full = path.to_vec();
                full.push(missing.clone());
                DiError::DependencyNotFound {
                    key: missing,
                    parameter,
                    path: full,
                }
            }
            Ok(di) => di,
            Err(other) => {
                let boxed: Box<dyn std::error::Error + Send + Sync> = other.into();
                DiError::Construction {
                    key: key.clone(),
                    path: path.to_vec(),
                    source: Arc::from(boxed),
                }
            }
        }
    }

    pub(crate) fn not_found(key: &Key, parameter: Option<&str>, path: &[Key]) -> Self {
        DiError::DependencyNotFound {
            key: key.clone(),
            parameter: parameter.map(str::to_string),
            path: path.to_vec(),
        }
    }

    pub(crate) fn binding(key: &Key, reason: impl Into<String>) -> Self {
        DiError::Binding {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// The dependency path attached to the error, when it has one.
    pub fn path(&self) -> Option<&[Key]> {
        match self {
            DiError::DependencyNotFound { path, .. }
            | DiError::CircularDependency { path }
            | DiError::Scope { path, .. }
            | DiError::AsyncResolution { path, .. }
            | DiError::Construction { path, .. } => Some(path),
            _ => None,
        }
    }

    /// True for `Binding` and `AlreadyRegistered`.
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            DiError::Binding { .. } | DiError::AlreadyRegistered { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiError::DependencyNotFound { .. })
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, DiError::CircularDependency { .. })
    }

    pub fn is_scope_error(&self) -> bool {
        matches!(self, DiError::Scope { .. })
    }
}

fn parameter_suffix(parameter: &Option<String>) -> String {
    match parameter {
        Some(name) => format!(" (parameter '{}')", name),
        None => String::new(),
    }
}

fn trail(path: &[Key]) -> String {
    if path.len() > 1 {
        format!(" (via {})", format_path(path))
    } else {
        String::new()
    }
}

fn join_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
