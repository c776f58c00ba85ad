//! Modules group related bindings so they can be installed together.

use std::any::type_name;
use std::borrow::Cow;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::binding::{Binding, BindingBuilder};
use crate::container::Container;
use crate::error::DiResult;
use crate::key::Key;
use crate::resource::{erase, Instance};

/// A unit of configuration applied through [`Container::install`].
pub trait Module: Send + Sync {
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    fn configure(&self, binder: &mut Binder<'_>) -> DiResult<()>;
}

impl<F> Module for F
where
    F: Fn(&mut Binder<'_>) -> DiResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn configure(&self, binder: &mut Binder<'_>) -> DiResult<()> {
        self(binder)
    }
}

/// Registration surface handed to [`Module::configure`].
pub struct Binder<'a> {
    container: &'a Container,
    registered: Vec<Key>,
}

impl<'a> Binder<'a> {
    pub(crate) fn new(container: &'a Container) -> Self {
        Self {
            container,
            registered: Vec::new(),
        }
    }

    pub fn bind(&mut self, binding: impl Into<BindingBuilder>) -> DiResult<&mut Self> {
        let binding = binding.into().build()?;
        self.register(binding)
    }

    /// Binds `value` under `name`.
    pub fn value<V: Send + Sync + 'static>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        value: V,
    ) -> DiResult<&mut Self> {
        self.bind(Binding::named::<V>(name).to_value(value))
    }

    /// Applies another module through this binder.
    pub fn install(&mut self, module: &dyn Module) -> DiResult<&mut Self> {
        debug!(module = module.name(), "Installing nested module");
        module.configure(self)?;
        Ok(self)
    }

    pub fn container(&self) -> &Container {
        self.container
    }

    /// Keys bound so far, in order.
    pub fn registered(&self) -> &[Key] {
        &self.registered
    }

    fn register(&mut self, binding: Binding) -> DiResult<&mut Self> {
        let key = binding.key().clone();
        self.container.register(binding)?;
        self.registered.push(key);
        Ok(self)
    }

    pub(crate) fn into_registered(self) -> Vec<Key> {
        self.registered
    }
}

struct Entry {
    name: Cow<'static, str>,
    value: Instance,
    type_name: &'static str,
}

/// Module binding named configuration values.
#[derive(Default)]
pub struct ValuesModule {
    entries: Vec<Entry>,
}

impl ValuesModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value<V: Send + Sync + 'static>(
        mut self,
        name: impl Into<Cow<'static, str>>,
        value: V,
    ) -> Self {
        self.entries.push(Entry {
            name: name.into(),
            value: erase(Arc::new(value)),
            type_name: type_name::<V>(),
        });
        self
    }

    /// One binding per top-level field of a JSON object. Strings bind as `String`,
    /// booleans as `bool`, integers as `i64`, other numbers as `f64`, anything else
    /// as `serde_json::Value`.
    pub fn from_json(value: &Value) -> Self {
        let mut module = Self::new();
        if let Value::Object(fields) = value {
            for (name, field) in fields {
                let name = name.clone();
                module = match field {
                    Value::String(s) => module.value(name, s.clone()),
                    Value::Bool(b) => module.value(name, *b),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => module.value(name, i),
                        None => module.value(name, n.as_f64().unwrap_or(f64::NAN)),
                    },
                    other => module.value(name, other.clone()),
                };
            }
        }
        module
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Module for ValuesModule {
    fn name(&self) -> &str {
        "values"
    }

    fn configure(&self, binder: &mut Binder<'_>) -> DiResult<()> {
        for entry in &self.entries {
            let binding = Binding::erased_instance(
                Key::named(entry.name.clone()),
                Arc::clone(&entry.value),
                entry.type_name,
            );
            binder.register(binding)?;
        }
        Ok(())
    }
}
