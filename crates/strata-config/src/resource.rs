use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attr::AttrValue;

/// A single resource declaration within a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDef {
  pub name: String,
  #[serde(flatten)]
  pub ty: ResourceType,
  #[serde(default)]
  pub inputs: BTreeMap<String, AttrValue>,
  /// Explicit ordering constraints, in addition to edges implied by input
  /// references.
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Identity-defining attributes: a change to any of these forces a
  /// destroy-and-recreate rather than an in-place update.
  #[serde(default)]
  pub replace_triggers: Vec<String>,
  /// Publish the node's `host`/`port` outputs under a service name once it
  /// reaches Ready.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub expose: Option<ExposeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceType {
  /// A declaratively provisioned resource, handled by the resource driver
  /// for its kind.
  Resource { kind: ResourceKind },

  /// An imperative one-shot function that participates in the graph and
  /// writes its result into a secret.
  ExternalFunction {
    /// Name the function is registered under in the engine.
    function: String,
    /// The secret this invocation is permitted to mutate.
    target_secret: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
  },
}

/// Capability tag for a declaratively provisioned resource.
///
/// Kinds are opaque to the engine; the concrete drivers behind them are
/// external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
  Cluster,
  Database,
  Broker,
  ComputeTask,
  LoadBalancer,
  DnsNamespace,
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ResourceKind::Cluster => "cluster",
      ResourceKind::Database => "database",
      ResourceKind::Broker => "broker",
      ResourceKind::ComputeTask => "compute-task",
      ResourceKind::LoadBalancer => "load-balancer",
      ResourceKind::DnsNamespace => "dns-namespace",
    };
    f.write_str(s)
  }
}

/// Publishes a node's network location to the service registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposeDef {
  /// Logical service name other nodes resolve.
  pub service: String,
  /// Resolution-cache lifetime for the registered endpoint.
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
  60
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn resource_def_roundtrips() {
    let def: ResourceDef = serde_json::from_value(json!({
      "name": "database",
      "type": "resource",
      "kind": "database",
      "inputs": { "port": 5432 },
      "replace_triggers": ["engine"],
      "expose": { "service": "database", "ttl_secs": 300 }
    }))
    .unwrap();

    assert_eq!(def.name, "database");
    assert_eq!(
      def.ty,
      ResourceType::Resource {
        kind: ResourceKind::Database
      }
    );
    assert_eq!(def.replace_triggers, vec!["engine".to_string()]);
    assert_eq!(def.expose.as_ref().unwrap().ttl_secs, 300);
  }

  #[test]
  fn external_function_def_parses() {
    let def: ResourceDef = serde_json::from_value(json!({
      "name": "key-generator",
      "type": "external_function",
      "function": "encoded-key",
      "target_secret": "shared-encryption-key"
    }))
    .unwrap();

    match def.ty {
      ResourceType::ExternalFunction {
        function,
        target_secret,
        ..
      } => {
        assert_eq!(function, "encoded-key");
        assert_eq!(target_secret, "shared-encryption-key");
      }
      other => panic!("unexpected type: {:?}", other),
    }
  }
}
