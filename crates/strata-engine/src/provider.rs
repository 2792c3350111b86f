//! The driver interface for declaratively provisioned resources.
//!
//! Concrete drivers wrap managed services (a container platform, a managed
//! database, a load balancer, a private DNS namespace) and are external
//! collaborators; the engine only sees opaque kinds, inputs, and outputs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use strata_config::ResourceKind;

/// Input attributes after reference resolution, keyed by attribute name.
///
/// A `BTreeMap` so that equality and serialization are order-independent;
/// the persisted form of this map is what re-apply diffs against.
pub type ResolvedInputs = BTreeMap<String, serde_json::Value>;

/// Output attributes observed after successful provisioning.
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// Failure reported by a resource driver.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ProviderError {
  pub message: String,
}

impl ProviderError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Create/update/delete operations for one or more resource kinds.
///
/// Implementations must converge: `create` on a half-provisioned resource
/// (left in Provisioning by a cancelled run) is expected to adopt or finish
/// it rather than fail on the duplicate.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
  async fn create(
    &self,
    name: &str,
    kind: ResourceKind,
    inputs: &ResolvedInputs,
  ) -> Result<Outputs, ProviderError>;

  async fn update(
    &self,
    name: &str,
    kind: ResourceKind,
    inputs: &ResolvedInputs,
    prior_outputs: &Outputs,
  ) -> Result<Outputs, ProviderError>;

  async fn delete(
    &self,
    name: &str,
    kind: ResourceKind,
    outputs: &Outputs,
  ) -> Result<(), ProviderError>;
}
