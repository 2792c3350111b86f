//! Strata Graph
//!
//! The validated, execution-ready graph model. A [`DependencyGraph`] is the
//! resolved form of a deployment definition: every node registered exactly
//! once, every edge anchored to known nodes, the whole acyclic.
//!
//! Key guarantees:
//! - `validate()` rejects cyclic graphs and names the cycle
//! - `topological_order()` is deterministic: ties among simultaneously
//!   ready nodes break by declaration order, so output is diff-friendly
//!   across runs
//! - no partial graph ever reaches the engine; construction errors are
//!   fatal before any provisioning begins

mod error;
mod graph;
mod node;

pub use error::GraphError;
pub use graph::DependencyGraph;
pub use node::{ExternalFunctionSpec, Node, NodeState, NodeType};
