//! Diffing declared state against the persisted record of the last apply.
//!
//! `plan` is the read-only half: it reports what `apply` would do without
//! touching any driver. The same per-node decision logic backs both paths.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use strata_config::AttrValue;
use strata_graph::{DependencyGraph, GraphError, Node, NodeState, NodeType};

use crate::provider::{Outputs, ResolvedInputs};

/// Reserved key under which an external function node's payload is folded
/// into its persisted inputs, so payload edits re-trigger the invocation.
pub(crate) const PAYLOAD_KEY: &str = "$payload";

/// What the last apply recorded about a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorRecord {
  pub inputs: ResolvedInputs,
  pub outputs: Outputs,
  pub state: NodeState,
}

/// Node name to last-applied record, loaded from the state store.
pub type PriorState = HashMap<String, PriorRecord>;

/// Intended action for one node, computed without provisioning anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
  Create,
  Update,
  /// Destroy-and-recreate; requires confirmation at apply time.
  Replace,
  Noop,
  /// External function will be invoked.
  Invoke,
  /// Inputs reference upstream outputs; the decision lands at apply time.
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
  pub node: String,
  pub action: PlannedAction,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

/// The per-node decision once inputs are fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decision {
  Create,
  Update,
  Replace { attributes: Vec<String> },
  Noop,
}

/// Compare resolved inputs against the prior record.
///
/// Only a record that actually reached Ready is trusted for diffing; a
/// node left in Provisioning by a cancelled run is re-created (drivers
/// converge on a half-provisioned resource).
pub(crate) fn decide(
  prior: Option<&PriorRecord>,
  resolved: &ResolvedInputs,
  replace_triggers: &[String],
) -> Decision {
  let record = match prior {
    Some(record) if record.state == NodeState::Ready => record,
    _ => return Decision::Create,
  };

  if record.inputs == *resolved {
    return Decision::Noop;
  }

  let attributes: Vec<String> = replace_triggers
    .iter()
    .filter(|attr| record.inputs.get(*attr) != resolved.get(*attr))
    .cloned()
    .collect();
  if attributes.is_empty() {
    Decision::Update
  } else {
    Decision::Replace { attributes }
  }
}

/// Compute the intended action for every node, in topological order.
pub fn plan(
  graph: &DependencyGraph,
  prior: &PriorState,
) -> Result<Vec<PlannedChange>, GraphError> {
  let order = graph.topological_order()?;
  let mut changes = Vec::with_capacity(order.len());

  for name in &order {
    let node = graph.get(name).expect("ordered node is registered");
    changes.push(plan_node(node, prior.get(name)));
  }
  Ok(changes)
}

fn plan_node(node: &Node, prior: Option<&PriorRecord>) -> PlannedChange {
  let has_references = node.inputs.values().any(|v| !v.is_literal());

  let (action, detail) = match (&node.ty, prior) {
    (NodeType::ExternalFunction(_), Some(record)) if record.state == NodeState::Ready => {
      if has_references {
        (PlannedAction::Unknown, None)
      } else if literal_inputs(node) == record.inputs {
        (PlannedAction::Noop, None)
      } else {
        (PlannedAction::Invoke, None)
      }
    }
    (NodeType::ExternalFunction(_), _) => (PlannedAction::Invoke, None),

    (NodeType::Resource { .. }, Some(record)) if record.state == NodeState::Ready => {
      if has_references {
        (
          PlannedAction::Unknown,
          Some("inputs reference upstream outputs".to_string()),
        )
      } else {
        match decide(prior, &literal_inputs(node), &node.replace_triggers) {
          Decision::Noop => (PlannedAction::Noop, None),
          Decision::Update => (PlannedAction::Update, None),
          Decision::Replace { attributes } => (
            PlannedAction::Replace,
            Some(format!("changed: {}", attributes.join(", "))),
          ),
          Decision::Create => (PlannedAction::Create, None),
        }
      }
    }
    (NodeType::Resource { .. }, _) => (PlannedAction::Create, None),
  };

  PlannedChange {
    node: node.name.clone(),
    action,
    detail,
  }
}

/// The resolved form a node's inputs take when every value is a literal.
fn literal_inputs(node: &Node) -> ResolvedInputs {
  let mut inputs: ResolvedInputs = node
    .inputs
    .iter()
    .filter_map(|(k, v)| match v {
      AttrValue::Literal(value) => Some((k.clone(), value.clone())),
      _ => None,
    })
    .collect();
  if let NodeType::ExternalFunction(spec) = &node.ty {
    inputs.insert(PAYLOAD_KEY.to_string(), spec.payload.clone());
  }
  inputs
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use serde_json::json;
  use strata_config::ResourceKind;
  use strata_graph::Node;

  use super::*;

  fn record(inputs: &[(&str, serde_json::Value)], state: NodeState) -> PriorRecord {
    PriorRecord {
      inputs: inputs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect(),
      outputs: Outputs::new(),
      state,
    }
  }

  fn resolved(inputs: &[(&str, serde_json::Value)]) -> ResolvedInputs {
    inputs
      .iter()
      .map(|(k, v)| (k.to_string(), v.clone()))
      .collect()
  }

  #[test]
  fn missing_record_means_create() {
    let decision = decide(None, &resolved(&[("port", json!(5432))]), &[]);
    assert_eq!(decision, Decision::Create);
  }

  #[test]
  fn provisioning_record_is_not_trusted() {
    let prior = record(&[("port", json!(5432))], NodeState::Provisioning);
    let decision = decide(Some(&prior), &resolved(&[("port", json!(5432))]), &[]);
    assert_eq!(decision, Decision::Create);
  }

  #[test]
  fn unchanged_inputs_are_a_noop() {
    let prior = record(&[("port", json!(5432))], NodeState::Ready);
    let decision = decide(Some(&prior), &resolved(&[("port", json!(5432))]), &[]);
    assert_eq!(decision, Decision::Noop);
  }

  #[test]
  fn changed_inputs_update_in_place() {
    let prior = record(&[("port", json!(5432))], NodeState::Ready);
    let decision = decide(
      Some(&prior),
      &resolved(&[("port", json!(5433))]),
      &["engine".to_string()],
    );
    assert_eq!(decision, Decision::Update);
  }

  #[test]
  fn identity_attribute_change_forces_replacement() {
    let prior = record(
      &[("engine", json!("postgres")), ("port", json!(5432))],
      NodeState::Ready,
    );
    let decision = decide(
      Some(&prior),
      &resolved(&[("engine", json!("mysql")), ("port", json!(5432))]),
      &["engine".to_string()],
    );
    assert_eq!(
      decision,
      Decision::Replace {
        attributes: vec!["engine".to_string()]
      }
    );
  }

  #[test]
  fn plan_marks_referencing_nodes_unknown() {
    let mut graph = DependencyGraph::new();
    graph
      .add_node(Node {
        name: "database".to_string(),
        ty: NodeType::Resource {
          kind: ResourceKind::Database,
        },
        inputs: BTreeMap::from([(
          "port".to_string(),
          AttrValue::Literal(json!(5432)),
        )]),
        replace_triggers: Vec::new(),
        expose: None,
      })
      .unwrap();
    graph
      .add_node(Node {
        name: "web".to_string(),
        ty: NodeType::Resource {
          kind: ResourceKind::ComputeTask,
        },
        inputs: BTreeMap::from([(
          "DATABASE_HOST".to_string(),
          AttrValue::Output {
            node: "database".to_string(),
            output: "host".to_string(),
          },
        )]),
        replace_triggers: Vec::new(),
        expose: None,
      })
      .unwrap();
    graph.add_edge("web", "database").unwrap();

    let mut prior = PriorState::new();
    prior.insert(
      "database".to_string(),
      record(&[("port", json!(5432))], NodeState::Ready),
    );
    prior.insert(
      "web".to_string(),
      record(&[("DATABASE_HOST", json!("db.internal"))], NodeState::Ready),
    );

    let changes = plan(&graph, &prior).unwrap();
    assert_eq!(changes[0].node, "database");
    assert_eq!(changes[0].action, PlannedAction::Noop);
    assert_eq!(changes[1].node, "web");
    assert_eq!(changes[1].action, PlannedAction::Unknown);
  }

  #[test]
  fn plan_creates_everything_on_first_run() {
    let mut graph = DependencyGraph::new();
    graph
      .add_node(Node {
        name: "broker".to_string(),
        ty: NodeType::Resource {
          kind: ResourceKind::Broker,
        },
        inputs: BTreeMap::new(),
        replace_triggers: Vec::new(),
        expose: None,
      })
      .unwrap();
    let changes = plan(&graph, &PriorState::new()).unwrap();
    assert_eq!(changes[0].action, PlannedAction::Create);
  }
}
