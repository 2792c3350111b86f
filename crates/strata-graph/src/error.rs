use thiserror::Error;

/// Graph construction and validation errors.
///
/// All of these are fatal: they are reported before any provisioning
/// begins, and no partial graph is ever executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
  /// A node name was registered twice.
  #[error("duplicate node identity: '{name}'")]
  DuplicateIdentity { name: String },

  /// An edge endpoint names a node that was never registered.
  #[error("unknown node: '{name}'")]
  UnknownNode { name: String },

  /// The edge set contains a cycle; `cycle` lists the nodes on it in order,
  /// first node repeated at the end.
  #[error("cyclic dependency: {}", .cycle.join(" -> "))]
  CyclicDependency { cycle: Vec<String> },
}
