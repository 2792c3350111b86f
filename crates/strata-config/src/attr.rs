//! Input attribute values for resource definitions.
//!
//! An attribute is either a literal JSON scalar or a reference to something
//! that only exists once provisioning is underway: another node's output,
//! a secret, or a registered service endpoint. References are resolved at
//! the moment a node is provisioned, never at graph-construction time, so
//! every consumer sees the value (and secret version) current at its own
//! execution.
//!
//! # Examples
//!
//! ```json
//! {
//!   "name": "workflows",
//!   "port": 5432,
//!   "password": { "secret": "db-password" },
//!   "host": { "node": "database", "output": "host" },
//!   "broker_url": { "service": "broker" }
//! }
//! ```

use serde::{Deserialize, Serialize};

/// A declared input attribute value.
///
/// Every reference form implies a must-provision-before edge to the node
/// that produces the referenced value; the resolver adds those edges
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
  /// Reference to another node's output attribute.
  Output { node: String, output: String },

  /// Reference to a named secret, resolved through the secret store.
  Secret { secret: String },

  /// Reference to a registered service endpoint, rendered as `host:port`.
  Endpoint { service: String },

  /// A literal value, passed through unchanged.
  Literal(serde_json::Value),
}

impl AttrValue {
  /// True when the value can be compared without provisioning anything.
  pub fn is_literal(&self) -> bool {
    matches!(self, AttrValue::Literal(_))
  }
}
