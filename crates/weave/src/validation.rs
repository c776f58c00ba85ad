//! Static dependency graph built from registered bindings.
//!
//! Used by `validate()` to report every missing dependency and every cycle in one
//! pass without constructing anything, and exported by
//! [`Container::dependency_graph`](crate::Container::dependency_graph).

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::binding::{Binding, Lifecycle, Param};
use crate::error::{DiError, DiResult};
use crate::key::{format_path, Key};
use crate::registry::BindingMap;

/// One declared parameter satisfied by another binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub parameter: String,
    pub target: Key,
    /// Lazy edges are resolved on use and never form a cycle.
    pub lazy: bool,
}

#[derive(Debug, Clone)]
struct Node {
    lifecycle: Lifecycle,
    edges: Vec<Edge>,
    missing: Vec<(String, Key)>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<Key, Node>,
}

/// Size figures for a [`DependencyGraph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub max_dependencies: usize,
    pub max_dependents: usize,
}

/// Key a parameter would be resolved from without explicit arguments.
fn static_target(param: &Param, bindings: &BindingMap) -> Option<Key> {
    param
        .candidate_keys()
        .into_iter()
        .find(|key| bindings.contains_key(key))
}

impl DependencyGraph {
    pub fn from_bindings(bindings: &BindingMap) -> Self {
        let nodes = bindings
            .iter()
            .map(|(key, binding)| (key.clone(), Self::node_for(binding, bindings)))
            .collect();
        Self { nodes }
    }

    fn node_for(binding: &Binding, bindings: &BindingMap) -> Node {
        let mut edges = Vec::new();
        let mut missing = Vec::new();

        for param in binding.params() {
            match static_target(param, bindings) {
                Some(target) => edges.push(Edge {
                    parameter: param.name().to_string(),
                    target,
                    lazy: param.is_lazy(),
                }),
                None if param.has_default() || param.is_optional() => {}
                None => missing.push((param.name().to_string(), param.expected_key())),
            }
        }

        Node {
            lifecycle: binding.lifecycle().clone(),
            edges,
            missing,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.nodes.keys()
    }

    pub fn edges(&self, key: &Key) -> &[Edge] {
        self.nodes
            .get(key)
            .map(|node| node.edges.as_slice())
            .unwrap_or(&[])
    }

    /// Keys `key` depends on directly, lazy edges included.
    pub fn dependencies(&self, key: &Key) -> Vec<Key> {
        self.edges(key).iter().map(|e| e.target.clone()).collect()
    }

    /// Keys that depend directly on `key`.
    pub fn dependents(&self, key: &Key) -> Vec<Key> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.edges.iter().any(|e| &e.target == key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn has_dependency(&self, dependent: &Key, dependency: &Key) -> bool {
        self.edges(dependent).iter().any(|e| &e.target == dependency)
    }

    /// Cycles closed by a back edge of a depth-first walk over eager edges, each
    /// reported once as a closed path `[A, B, A]`.
    pub fn find_cycles(&self) -> Vec<Vec<Key>> {
        let mut cycles = Vec::new();
        let mut seen: HashSet<Vec<Key>> = HashSet::new();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for key in self.nodes.keys() {
            if !visited.contains(key) {
                self.dfs(key, &mut visited, &mut on_stack, &mut path, &mut cycles, &mut seen);
            }
        }
        cycles
    }

    fn dfs(
        &self,
        key: &Key,
        visited: &mut HashSet<Key>,
        on_stack: &mut HashSet<Key>,
        path: &mut Vec<Key>,
        cycles: &mut Vec<Vec<Key>>,
        seen: &mut HashSet<Vec<Key>>,
    ) {
        visited.insert(key.clone());
        on_stack.insert(key.clone());
        path.push(key.clone());

        for edge in self.edges(key).iter().filter(|e| !e.lazy) {
            let next = &edge.target;
            if on_stack.contains(next) {
                if let Some(start) = path.iter().position(|k| k == next) {
                    let ring = path[start..].to_vec();
                    if seen.insert(self.canonical(&ring)) {
                        let mut cycle = ring;
                        cycle.push(next.clone());
                        cycles.push(cycle);
                    }
                }
            } else if !visited.contains(next) {
                self.dfs(next, visited, on_stack, path, cycles, seen);
            }
        }

        on_stack.remove(key);
        path.pop();
    }

    /// Rotation of `ring` starting at its earliest registered key.
    fn canonical(&self, ring: &[Key]) -> Vec<Key> {
        let start = ring
            .iter()
            .enumerate()
            .min_by_key(|(_, k)| self.nodes.get_index_of(*k).unwrap_or(usize::MAX))
            .map(|(i, _)| i)
            .unwrap_or(0);
        ring[start..].iter().chain(&ring[..start]).cloned().collect()
    }

    /// Bindings ordered so every key comes after its eager dependencies.
    pub fn topological_order(&self) -> DiResult<Vec<Key>> {
        let mut in_degree: HashMap<&Key, usize> = self.nodes.keys().map(|k| (k, 0)).collect();
        let mut dependents: HashMap<&Key, Vec<&Key>> = HashMap::new();

        for (key, node) in &self.nodes {
            for edge in node.edges.iter().filter(|e| !e.lazy) {
                if let Some(degree) = in_degree.get_mut(key) {
                    *degree += 1;
                }
                dependents.entry(&edge.target).or_default().push(key);
            }
        }

        let mut queue: VecDeque<&Key> = self
            .nodes
            .keys()
            .filter(|k| in_degree.get(k) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(key) = queue.pop_front() {
            order.push(key.clone());
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let path = self.find_cycles().into_iter().next().unwrap_or_default();
            Err(DiError::CircularDependency { path })
        }
    }

    /// All discoverable problems: missing dependencies first, then cycles.
    pub fn validate(&self) -> Vec<DiError> {
        let mut errors = Vec::new();

        for (key, node) in &self.nodes {
            for (parameter, missing) in &node.missing {
                errors.push(DiError::not_found(
                    missing,
                    Some(parameter),
                    &[key.clone(), missing.clone()],
                ));
            }
        }

        for cycle in self.find_cycles() {
            debug!(cycle = %format_path(&cycle), "Cycle found during validation");
            errors.push(DiError::CircularDependency { path: cycle });
        }

        errors
    }

    pub fn stats(&self) -> DependencyGraphStats {
        let mut incoming: HashMap<&Key, usize> = HashMap::new();
        for node in self.nodes.values() {
            for edge in &node.edges {
                *incoming.entry(&edge.target).or_default() += 1;
            }
        }

        DependencyGraphStats {
            total_nodes: self.nodes.len(),
            total_edges: self.nodes.values().map(|n| n.edges.len()).sum(),
            max_dependencies: self.nodes.values().map(|n| n.edges.len()).max().unwrap_or(0),
            max_dependents: incoming.values().copied().max().unwrap_or(0),
        }
    }

    /// `{ "<key>": { "lifecycle": "...", "dependencies": [...] } }` in registration order.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, node) in &self.nodes {
            let dependencies: Vec<Value> = node
                .edges
                .iter()
                .map(|e| {
                    json!({
                        "parameter": e.parameter,
                        "key": e.target.label(),
                        "lazy": e.lazy,
                    })
                })
                .collect();
            let missing: Vec<String> = node.missing.iter().map(|(_, k)| k.label()).collect();
            map.insert(
                key.label(),
                json!({
                    "lifecycle": node.lifecycle.to_string(),
                    "dependencies": dependencies,
                    "missing": missing,
                }),
            );
        }
        Value::Object(map)
    }
}
