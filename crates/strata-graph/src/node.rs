use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strata_config::{AttrValue, ExposeDef, ResourceKind};

/// A provisionable node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  /// Stable identity, unique within the graph.
  pub name: String,
  pub ty: NodeType,
  /// Declared input attributes; references resolve at provisioning time.
  pub inputs: BTreeMap<String, AttrValue>,
  /// Attributes whose change forces destroy-and-recreate.
  pub replace_triggers: Vec<String>,
  /// Service registration performed when the node reaches Ready.
  pub expose: Option<ExposeDef>,
}

/// The two provisioning flavors a node can have.
///
/// Both flow through the same engine path; the variant is the single
/// dispatch point between the declarative driver interface and the
/// imperative external-function protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
  Resource { kind: ResourceKind },
  ExternalFunction(ExternalFunctionSpec),
}

/// An imperative one-shot function participating as a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFunctionSpec {
  pub function: String,
  /// The only secret this invocation may mutate.
  pub target_secret: String,
  pub payload: serde_json::Value,
  pub timeout_ms: Option<u64>,
  pub max_attempts: Option<u32>,
}

/// Lifecycle state of a node within one apply run.
///
/// A node transitions to Ready only after every node it references has
/// reached Ready. A node left in Provisioning (cancelled run) is re-resolved
/// on the next apply, never assumed Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Pending,
  Provisioning,
  Ready,
  Failed,
}
