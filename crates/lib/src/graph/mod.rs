//! Module dependency graph.
//!
//! Modules form a forest: each module names at most one upstream module whose
//! output it is built on. The graph is validated once at construction, so a
//! [`ModuleGraph`] in hand is always acyclic and fully resolved.

use std::collections::HashMap;
use std::path::PathBuf;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A unit of the fork: one patch stack applied to one tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
  pub name: String,
  /// Directory holding the module's `.patch` files.
  pub patches: PathBuf,
  /// Development checkout the working tree is written to.
  pub output: PathBuf,
  /// Module whose output this module patches; `None` patches the upstream snapshot.
  pub upstream: Option<String>,
  /// External libraries handed to the toolchain untouched.
  #[serde(default)]
  pub dependencies: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("module '{0}' is declared more than once")]
  DuplicateModule(String),

  #[error("module '{module}' depends on unknown module '{upstream}'")]
  UnknownUpstream { module: String, upstream: String },

  #[error("cyclic module dependency involving '{0}'")]
  CyclicDependency(String),
}

/// Validated module dependency graph. Edges run from upstream to dependent.
#[derive(Debug)]
pub struct ModuleGraph {
  graph: DiGraph<Module, ()>,
  by_name: HashMap<String, NodeIndex>,
  order: Vec<NodeIndex>,
}

impl ModuleGraph {
  pub fn new(modules: Vec<Module>) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut by_name = HashMap::new();

    for module in modules {
      let name = module.name.clone();
      let idx = graph.add_node(module);
      if by_name.insert(name.clone(), idx).is_some() {
        return Err(GraphError::DuplicateModule(name));
      }
    }

    let edges: Vec<(NodeIndex, NodeIndex)> = graph
      .node_indices()
      .filter_map(|idx| graph[idx].upstream.as_ref().map(|up| (idx, up)))
      .map(|(idx, up)| {
        by_name
          .get(up)
          .map(|&up_idx| (up_idx, idx))
          .ok_or_else(|| GraphError::UnknownUpstream {
            module: graph[idx].name.clone(),
            upstream: up.clone(),
          })
      })
      .collect::<Result<_, _>>()?;

    for (from, to) in edges {
      graph.add_edge(from, to, ());
    }

    let order = toposort(&graph, None).map_err(|cycle| GraphError::CyclicDependency(graph[cycle.node_id()].name.clone()))?;

    debug!(modules = graph.node_count(), "built module graph");
    Ok(Self { graph, by_name, order })
  }

  pub fn get(&self, name: &str) -> Option<&Module> {
    self.by_name.get(name).map(|&idx| &self.graph[idx])
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// Modules in declaration order.
  pub fn modules(&self) -> impl Iterator<Item = &Module> {
    self.graph.node_indices().map(|idx| &self.graph[idx])
  }

  /// Modules ordered so every upstream precedes its dependents.
  pub fn resolve_order(&self) -> Vec<&Module> {
    self.order.iter().map(|&idx| &self.graph[idx]).collect()
  }

  /// Groups of module names that can be processed concurrently.
  ///
  /// Every module's upstream lies in an earlier wave. Within a wave, modules
  /// keep declaration order.
  pub fn waves(&self) -> Vec<Vec<String>> {
    let mut level: HashMap<NodeIndex, usize> = HashMap::new();
    for &idx in &self.order {
      let depth = self
        .graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter_map(|up| level.get(&up))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      level.insert(idx, depth);
    }

    let depth = level.values().copied().max().map_or(0, |m| m + 1);
    let mut waves = vec![Vec::new(); depth];
    for idx in self.graph.node_indices() {
      waves[level[&idx]].push(self.graph[idx].name.clone());
    }
    waves
  }

  /// Names of modules built directly on `name`.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    let Some(&idx) = self.by_name.get(name) else {
      return Vec::new();
    };
    let mut names: Vec<_> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|d| self.graph[d].name.clone())
      .collect();
    names.sort();
    names
  }

  /// `name` followed by every module transitively built on it.
  pub fn downstream_of(&self, name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut queue = vec![name.to_string()];
    while let Some(next) = queue.pop() {
      if out.contains(&next) {
        continue;
      }
      queue.extend(self.dependents(&next));
      out.push(next);
    }
    out
  }
}
