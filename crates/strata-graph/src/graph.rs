use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::GraphError;
use crate::node::Node;

/// A directed acyclic graph of provisionable nodes.
///
/// An edge `from -> to` records that `from` depends on `to`'s output; `to`
/// must reach Ready before `from` is attempted. Declaration order is
/// remembered so that ordering ties always break the same way.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
  nodes: HashMap<String, Node>,
  /// Node names in declaration order.
  order: Vec<String>,
  /// name -> names it depends on.
  deps: HashMap<String, Vec<String>>,
  /// name -> names that depend on it.
  dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a node. Fails if the name is already taken.
  pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
    if self.nodes.contains_key(&node.name) {
      return Err(GraphError::DuplicateIdentity {
        name: node.name.clone(),
      });
    }
    self.order.push(node.name.clone());
    self.deps.entry(node.name.clone()).or_default();
    self.dependents.entry(node.name.clone()).or_default();
    self.nodes.insert(node.name.clone(), node);
    Ok(())
  }

  /// Record that `from` depends on `to`'s output.
  ///
  /// Parallel edges are collapsed; both endpoints must already be
  /// registered.
  pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
    for name in [from, to] {
      if !self.nodes.contains_key(name) {
        return Err(GraphError::UnknownNode {
          name: name.to_string(),
        });
      }
    }
    let deps = self.deps.get_mut(from).expect("endpoint checked above");
    if deps.iter().any(|d| d == to) {
      return Ok(());
    }
    deps.push(to.to_string());
    self
      .dependents
      .get_mut(to)
      .expect("endpoint checked above")
      .push(from.to_string());
    Ok(())
  }

  /// Cycle detection via depth-first search with a three-color marking.
  ///
  /// On failure the error names the nodes on the cycle, in order, with the
  /// entry node repeated at the end.
  pub fn validate(&self) -> Result<(), GraphError> {
    // 0 = unvisited, 1 = on the current path, 2 = fully explored
    let mut color: HashMap<&str, u8> = self.order.iter().map(|n| (n.as_str(), 0u8)).collect();
    let mut path: Vec<&str> = Vec::new();

    fn dfs<'a>(
      node: &'a str,
      deps: &'a HashMap<String, Vec<String>>,
      color: &mut HashMap<&'a str, u8>,
      path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
      color.insert(node, 1);
      path.push(node);

      if let Some(next) = deps.get(node) {
        for dep in next {
          match color.get(dep.as_str()) {
            // Back edge: the cycle is the path suffix starting at `dep`.
            Some(1) => {
              let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
              let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
              cycle.push(dep.clone());
              return Some(cycle);
            }
            Some(0) => {
              if let Some(cycle) = dfs(dep.as_str(), deps, color, path) {
                return Some(cycle);
              }
            }
            _ => {}
          }
        }
      }

      color.insert(node, 2);
      path.pop();
      None
    }

    for name in &self.order {
      if color.get(name.as_str()) == Some(&0) {
        if let Some(cycle) = dfs(name.as_str(), &self.deps, &mut color, &mut path) {
          return Err(GraphError::CyclicDependency { cycle });
        }
      }
    }
    Ok(())
  }

  /// A linear order consistent with every edge: dependencies always precede
  /// dependents.
  ///
  /// Kahn's algorithm with a min-heap keyed on declaration index, so the
  /// result is deterministic across repeated calls and across runs.
  pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
    self.validate()?;

    let index: HashMap<&str, usize> = self
      .order
      .iter()
      .enumerate()
      .map(|(i, n)| (n.as_str(), i))
      .collect();

    let mut remaining: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|n| (n.as_str(), self.deps[n].len()))
      .collect();

    let mut ready: BinaryHeap<Reverse<(usize, &str)>> = remaining
      .iter()
      .filter(|(_, count)| **count == 0)
      .map(|(name, _)| Reverse((index[name], *name)))
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(Reverse((_, name))) = ready.pop() {
      sorted.push(name.to_string());
      for dependent in &self.dependents[name] {
        let count = remaining
          .get_mut(dependent.as_str())
          .expect("dependent registered");
        *count -= 1;
        if *count == 0 {
          ready.push(Reverse((index[dependent.as_str()], dependent.as_str())));
        }
      }
    }

    debug_assert_eq!(sorted.len(), self.order.len());
    Ok(sorted)
  }

  pub fn get(&self, name: &str) -> Option<&Node> {
    self.nodes.get(name)
  }

  /// Nodes in declaration order.
  pub fn nodes(&self) -> impl Iterator<Item = &Node> {
    self.order.iter().map(|n| &self.nodes[n])
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  /// Names this node depends on (must be Ready first).
  pub fn dependencies(&self, name: &str) -> &[String] {
    self.deps.get(name).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// Names that depend on this node.
  pub fn dependents(&self, name: &str) -> &[String] {
    self
      .dependents
      .get(name)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }
}
