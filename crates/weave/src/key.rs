//! Typed key space for bindings.
//!
//! A [`Key`] is either the identity of a Rust type (`Key::of::<Database>()`) or a
//! string name (`Key::named("db")`). Named keys still carry typed values; the type
//! is checked when the value is retrieved.

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of a binding inside a [`Registry`](crate::Registry).
#[derive(Clone)]
pub enum Key {
    /// Key derived from a type (`TypeId` plus the type name for diagnostics).
    Type { id: TypeId, name: &'static str },
    /// Key chosen by the caller.
    Named(Cow<'static, str>),
}

impl Key {
    /// Key for the type `T`. Works for unsized targets such as `dyn Trait`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Key::Type {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Key identified by a name only.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Key::Named(name.into())
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Key::Named(_))
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Key::Type { id, .. } => Some(*id),
            Key::Named(_) => None,
        }
    }

    /// Human readable label: the short type name or the binding name.
    pub fn label(&self) -> String {
        match self {
            Key::Type { name, .. } => short_type_name(name),
            Key::Named(name) => name.to_string(),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Type { id: a, .. }, Key::Type { id: b, .. }) => a == b,
            (Key::Named(a), Key::Named(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Key::Type { id, .. } => {
                0u8.hash(state);
                id.hash(state);
            }
            Key::Named(name) => {
                1u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Type { name, .. } => write!(f, "Key({})", name),
            Key::Named(name) => write!(f, "Key({:?})", name),
        }
    }
}

impl From<&'static str> for Key {
    fn from(name: &'static str) -> Self {
        Key::named(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::named(name)
    }
}

/// Strips module paths from a type name, keeping generic structure:
/// `alloc::sync::Arc<dyn app::Repo>` becomes `Arc<dyn Repo>`.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            segment.clear();
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            segment.push(c);
        } else {
            out.push_str(&segment);
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(&segment);
    out
}

/// Renders a resolution path as `A -> B -> A`.
pub(crate) fn format_path(path: &[Key]) -> String {
    path.iter()
        .map(Key::label)
        .collect::<Vec<_>>()
        .join(" -> ")
}
