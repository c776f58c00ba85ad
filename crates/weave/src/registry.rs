//! Binding registry.
//!
//! Writers serialize on a registry-wide mutex and publish a fresh map; readers
//! load the current map without locking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::binding::Binding;
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::validation::DependencyGraph;

pub(crate) type BindingMap = IndexMap<Key, Binding>;

pub struct Registry {
    bindings: ArcSwap<BindingMap>,
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            bindings: ArcSwap::from_pointee(IndexMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Stores `binding`. An existing binding for the same key is replaced only when
    /// `allow_override` is set here or on the binding; the previous one is returned.
    pub fn bind(&self, binding: Binding, allow_override: bool) -> DiResult<Option<Binding>> {
        let _guard = self.write_lock.lock();
        let current = self.bindings.load_full();
        let key = binding.key().clone();

        if current.contains_key(&key) && !(allow_override || binding.allows_override()) {
            return Err(DiError::AlreadyRegistered { key });
        }

        let mut next = (*current).clone();
        let previous = next.insert(key.clone(), binding);
        self.bindings.store(Arc::new(next));

        if previous.is_some() {
            warn!(key = %key, "Binding overridden");
        } else {
            debug!(key = %key, "Binding registered");
        }
        Ok(previous)
    }

    pub fn unbind(&self, key: &Key) -> Option<Binding> {
        let _guard = self.write_lock.lock();
        let current = self.bindings.load_full();
        if !current.contains_key(key) {
            return None;
        }
        let mut next = (*current).clone();
        let removed = next.shift_remove(key);
        self.bindings.store(Arc::new(next));
        debug!(key = %key, "Binding removed");
        removed
    }

    /// Restores `previous` for `key`, or removes the key when there was none.
    pub(crate) fn restore(&self, key: &Key, previous: Option<Binding>) {
        let _guard = self.write_lock.lock();
        let mut next = (*self.bindings.load_full()).clone();
        match previous {
            Some(binding) => {
                next.insert(key.clone(), binding);
            }
            None => {
                next.shift_remove(key);
            }
        }
        self.bindings.store(Arc::new(next));
    }

    pub fn lookup(&self, key: &Key) -> Option<Binding> {
        self.bindings.load().get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.bindings.load().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.bindings.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<Key> {
        self.bindings.load().keys().cloned().collect()
    }

    pub(crate) fn snapshot(&self) -> Arc<BindingMap> {
        self.bindings.load_full()
    }

    /// Every missing dependency and every cycle, without constructing anything.
    pub fn validate_all(&self) -> Vec<DiError> {
        DependencyGraph::from_bindings(&self.snapshot()).validate()
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.bindings.store(Arc::new(IndexMap::new()));
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
