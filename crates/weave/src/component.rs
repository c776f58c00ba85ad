//! Components: named units with a configure/start/stop lifecycle.
//!
//! A component declares the interfaces it provides and requires as [`Key`]s.
//! Starting walks the registry in dependency order, so the provider of every
//! required key is started first; stopping walks the recorded start sequence
//! backwards. Factories receive the owning [`Container`], which is how a
//! component reaches ordinary bindings.
//!
//! State machine:
//!
//! ```text
//! Initialized -> Configured -> Started <-> Stopped
//!        any state except Destroyed -> Destroyed
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use common::OperationTimer;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn, Level};

use crate::container::Container;
use crate::error::{DiError, DiResult};
use crate::key::Key;

/// Parameters handed to [`Component::configure`].
pub type ComponentConfig = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    /// Constructed, not yet configured
    Initialized,
    Configured,
    Started,
    Stopped,
    /// Terminal
    Destroyed,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentState::Initialized => write!(f, "initialized"),
            ComponentState::Configured => write!(f, "configured"),
            ComponentState::Started => write!(f, "started"),
            ComponentState::Stopped => write!(f, "stopped"),
            ComponentState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Lifecycle hooks of a component. The registry tracks the state and only calls
/// a hook when the transition is legal.
pub trait Component: Send + 'static {
    /// Called once after construction and again on reconfiguration.
    fn configure(&mut self, config: &ComponentConfig) -> anyhow::Result<()> {
        let _ = config;
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    /// Last hook before the component is dropped. Runs after `stop` when the
    /// component was still started.
    fn destroy(&mut self) {}
}

type ComponentFactory =
    Arc<dyn Fn(&Container) -> anyhow::Result<Box<dyn Component>> + Send + Sync>;

/// Registration record of a component.
#[derive(Clone)]
pub struct ComponentSpec {
    name: String,
    factory: ComponentFactory,
    provides: Vec<Key>,
    requires: Vec<Key>,
    tags: BTreeSet<String>,
    priority: i32,
    auto_start: bool,
    config: ComponentConfig,
}

impl ComponentSpec {
    pub fn new<C, F>(name: impl Into<String>, factory: F) -> Self
    where
        C: Component,
        F: Fn(&Container) -> anyhow::Result<C> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move |container: &Container| {
                factory(container).map(|component| Box::new(component) as Box<dyn Component>)
            }),
            provides: Vec::new(),
            requires: Vec::new(),
            tags: BTreeSet::new(),
            priority: 0,
            auto_start: true,
            config: ComponentConfig::new(),
        }
    }

    pub fn provides<T: ?Sized + 'static>(self) -> Self {
        self.provides_key(Key::of::<T>())
    }

    pub fn provides_key(mut self, key: impl Into<Key>) -> Self {
        self.provides.push(key.into());
        self
    }

    pub fn requires<T: ?Sized + 'static>(self) -> Self {
        self.requires_key(Key::of::<T>())
    }

    pub fn requires_key(mut self, key: impl Into<Key>) -> Self {
        self.requires.push(key.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Higher priorities are visited first when the startup order is computed.
    pub fn priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn auto_start(self, auto_start: bool) -> Self {
        Self { auto_start, ..self }
    }

    /// Adds one configuration parameter. Values that fail to serialize are skipped.
    pub fn setting(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.config.insert(key.into(), value);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provided(&self) -> &[Key] {
        &self.provides
    }

    pub fn required(&self) -> &[Key] {
        &self.requires
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn starts_automatically(&self) -> bool {
        self.auto_start
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("name", &self.name)
            .field("provides", &self.provides)
            .field("requires", &self.requires)
            .field("tags", &self.tags)
            .field("priority", &self.priority)
            .field("auto_start", &self.auto_start)
            .finish()
    }
}

struct Slot {
    component: Box<dyn Component>,
    state: ComponentState,
}

impl Slot {
    fn start(&mut self, name: &str) -> DiResult<()> {
        match self.state {
            ComponentState::Configured | ComponentState::Stopped => {
                self.component.start().map_err(|e| failure(name, "start", e))?;
                self.state = ComponentState::Started;
                Ok(())
            }
            state => Err(illegal(name, state, "start")),
        }
    }

    fn stop(&mut self, name: &str) -> DiResult<()> {
        match self.state {
            ComponentState::Started => {
                self.component.stop().map_err(|e| failure(name, "stop", e))?;
                self.state = ComponentState::Stopped;
                Ok(())
            }
            state => Err(illegal(name, state, "stop")),
        }
    }

    fn destroy(&mut self, name: &str) {
        if self.state == ComponentState::Destroyed {
            return;
        }
        if self.state == ComponentState::Started {
            if let Err(e) = self.stop(name) {
                warn!(component = %name, error = %e, "Stop failed during destroy");
            }
        }
        self.component.destroy();
        self.state = ComponentState::Destroyed;
    }
}

fn failure(name: &str, hook: &str, err: anyhow::Error) -> DiError {
    DiError::Component {
        name: name.to_string(),
        reason: format!("{} failed: {:#}", hook, err),
    }
}

fn illegal(name: &str, state: ComponentState, hook: &str) -> DiError {
    DiError::Component {
        name: name.to_string(),
        reason: format!("cannot {} a {} component", hook, state),
    }
}

/// Component specs, their live instances and the order they were started in.
#[derive(Default)]
pub struct ComponentRegistry {
    specs: RwLock<IndexMap<String, ComponentSpec>>,
    instances: RwLock<IndexMap<String, Arc<Mutex<Slot>>>>,
    started: Mutex<Vec<String>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a spec. Names are unique.
    pub fn register(&self, spec: ComponentSpec) -> DiResult<()> {
        if spec.name.trim().is_empty() {
            return Err(DiError::Component {
                name: spec.name,
                reason: "component name must not be empty".into(),
            });
        }
        let mut specs = self.specs.write();
        if specs.contains_key(&spec.name) {
            return Err(DiError::Component {
                name: spec.name,
                reason: "already registered".into(),
            });
        }
        info!(
            component = %spec.name,
            provides = spec.provides.len(),
            requires = spec.requires.len(),
            "Registering component"
        );
        specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn spec(&self, name: &str) -> Option<ComponentSpec> {
        self.specs.read().get(name).cloned()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.specs.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<String> {
        self.specs
            .read()
            .values()
            .filter(|spec| spec.tags.contains(tag))
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn by_interface(&self, key: &Key) -> Vec<String> {
        self.specs
            .read()
            .values()
            .filter(|spec| spec.provides.contains(key))
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ComponentState> {
        if let Some(slot) = self.instances.read().get(name) {
            return Some(slot.lock().state);
        }
        self.specs
            .read()
            .contains_key(name)
            .then_some(ComponentState::Initialized)
    }

    /// Every registered component with its state; not yet built ones report
    /// `Initialized`.
    pub fn states(&self) -> IndexMap<String, ComponentState> {
        self.names()
            .into_iter()
            .filter_map(|name| self.state(&name).map(|state| (name, state)))
            .collect()
    }

    /// Names of the components whose provided keys `name` requires. Keys nobody
    /// provides are left to the container.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        let specs = self.specs.read();
        dependencies_of(&specs, name)
    }

    /// Every registered component ordered so providers precede their dependents.
    /// Among independent components higher priorities come first.
    pub fn startup_order(&self) -> DiResult<Vec<String>> {
        let specs = self.specs.read();
        let mut roots: Vec<&ComponentSpec> = specs.values().collect();
        // Stable: equal priorities keep registration order.
        roots.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut order = Vec::with_capacity(specs.len());
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for spec in roots {
            visit(&specs, &spec.name, &mut visited, &mut stack, &mut order)?;
        }
        debug!(order = ?order, "Component startup order");
        Ok(order)
    }

    /// Builds and configures the component unless it already exists.
    pub fn create_instance(&self, name: &str, container: &Container) -> DiResult<ComponentState> {
        if let Some(state) = self.instances.read().get(name).map(|slot| slot.lock().state) {
            return Ok(state);
        }
        let spec = self.spec(name).ok_or_else(|| DiError::Component {
            name: name.to_string(),
            reason: "not registered".into(),
        })?;

        debug!(component = %name, "Creating component");
        let mut component = (spec.factory)(container).map_err(|e| failure(name, "construction", e))?;
        component
            .configure(&spec.config)
            .map_err(|e| failure(name, "configure", e))?;
        let slot = Slot {
            component,
            state: ComponentState::Configured,
        };

        let mut instances = self.instances.write();
        let slot = instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(slot)));
        let state = slot.lock().state;
        Ok(state)
    }

    /// Reruns `configure` with new parameters. Only legal before the first start.
    pub fn reconfigure(&self, name: &str, config: &ComponentConfig) -> DiResult<()> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock();
        match slot.state {
            ComponentState::Initialized | ComponentState::Configured => {
                slot.component
                    .configure(config)
                    .map_err(|e| failure(name, "configure", e))?;
                slot.state = ComponentState::Configured;
                Ok(())
            }
            state => Err(illegal(name, state, "configure")),
        }
    }

    /// Starts `names` (or every auto-start component) plus everything they depend
    /// on, in startup order. Components already started are left alone. Returns
    /// the names started by this call.
    pub fn start(&self, names: Option<&[&str]>, container: &Container) -> DiResult<Vec<String>> {
        let targets: Vec<String> = match names {
            Some(names) => names.iter().map(|name| name.to_string()).collect(),
            None => self
                .specs
                .read()
                .values()
                .filter(|spec| spec.auto_start)
                .map(|spec| spec.name.clone())
                .collect(),
        };
        let wanted = self.closure(&targets)?;
        let order = self.startup_order()?;

        let mut timer = OperationTimer::new("components_start").with_level(Level::DEBUG);
        timer.add_field("container", container.name());

        let mut launched = Vec::new();
        let result = order
            .into_iter()
            .filter(|name| wanted.contains(name))
            .try_for_each(|name| -> DiResult<()> {
                self.create_instance(&name, container)?;
                let slot = self.slot(&name)?;
                let mut slot = slot.lock();
                if matches!(slot.state, ComponentState::Configured | ComponentState::Stopped) {
                    slot.start(&name)?;
                    debug!(component = %name, "Component started");
                    self.started.lock().push(name.clone());
                    launched.push(name);
                }
                Ok(())
            });

        timer.add_field("items", launched.len());
        timer.finish_with_result(&result);
        result.map(|()| launched)
    }

    /// Stops `names` (or every started component) newest first. Every component is
    /// attempted; the first failure is returned. Returns the names stopped.
    pub fn stop(&self, names: Option<&[&str]>) -> DiResult<Vec<String>> {
        let sequence: Vec<String> = self.started.lock().iter().rev().cloned().collect();
        let mut stopped = Vec::new();
        let mut first_error = None;

        for name in sequence {
            if names.is_some_and(|names| !names.contains(&name.as_str())) {
                continue;
            }
            let Ok(slot) = self.slot(&name) else { continue };
            let outcome = {
                let mut slot = slot.lock();
                if slot.state != ComponentState::Started {
                    continue;
                }
                slot.stop(&name)
            };
            match outcome {
                Ok(()) => {
                    debug!(component = %name, "Component stopped");
                    self.started.lock().retain(|started| *started != name);
                    stopped.push(name);
                }
                Err(e) => {
                    warn!(component = %name, error = %e, "Component failed to stop");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !stopped.is_empty() {
            info!(stopped = stopped.len(), "Components stopped");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    /// Stops what is running, destroys every instance and forgets every spec.
    pub fn clear(&self) {
        if let Err(e) = self.stop(None) {
            warn!(error = %e, "Clearing components with a stop failure");
        }
        let instances: Vec<(String, Arc<Mutex<Slot>>)> =
            self.instances.write().drain(..).collect();
        for (name, slot) in instances.iter().rev() {
            slot.lock().destroy(name);
        }
        self.started.lock().clear();
        self.specs.write().clear();
    }

    fn slot(&self, name: &str) -> DiResult<Arc<Mutex<Slot>>> {
        self.instances
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DiError::Component {
                name: name.to_string(),
                reason: "no instance has been created".into(),
            })
    }

    /// `targets` plus their transitive dependencies.
    fn closure(&self, targets: &[String]) -> DiResult<HashSet<String>> {
        let specs = self.specs.read();
        let mut wanted = HashSet::new();
        let mut pending: Vec<String> = targets.to_vec();
        while let Some(name) = pending.pop() {
            if !specs.contains_key(&name) {
                return Err(DiError::Component {
                    name,
                    reason: "not registered".into(),
                });
            }
            if wanted.insert(name.clone()) {
                pending.extend(dependencies_of(&specs, &name));
            }
        }
        Ok(wanted)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .field("started", &*self.started.lock())
            .finish()
    }
}

fn dependencies_of(specs: &IndexMap<String, ComponentSpec>, name: &str) -> Vec<String> {
    let Some(spec) = specs.get(name) else {
        return Vec::new();
    };
    spec.requires
        .iter()
        .filter_map(|key| {
            specs
                .values()
                .find(|other| other.name != name && other.provides.contains(key))
                .map(|provider| provider.name.clone())
        })
        .collect()
}

fn visit(
    specs: &IndexMap<String, ComponentSpec>,
    name: &str,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
    order: &mut Vec<String>,
) -> DiResult<()> {
    if visited.contains(name) {
        return Ok(());
    }
    if let Some(start) = stack.iter().position(|entry| entry == name) {
        let mut cycle: Vec<Key> = stack[start..].iter().cloned().map(Key::from).collect();
        cycle.push(Key::from(name.to_string()));
        return Err(DiError::CircularDependency { path: cycle });
    }

    stack.push(name.to_string());
    for dependency in dependencies_of(specs, name) {
        visit(specs, &dependency, visited, stack, order)?;
    }
    stack.pop();

    visited.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}
