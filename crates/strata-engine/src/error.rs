//! Error types for graph execution.

use strata_graph::GraphError;
use strata_registry::RegistryError;
use strata_secrets::SecretError;
use thiserror::Error;

use crate::external::ExternalError;
use crate::provider::ProviderError;

/// Errors that can occur during an apply or teardown run.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
  /// The resource driver reported a failure for a node.
  #[error("provisioning failed for node '{node}': {source}")]
  ProvisioningFailed {
    node: String,
    #[source]
    source: ProviderError,
  },

  /// A declared input could not be resolved into a value.
  #[error("input resolution failed for node '{node}': {message}")]
  InputResolution { node: String, message: String },

  /// An identity-defining attribute changed; converging would destroy and
  /// recreate the resource, which needs explicit confirmation.
  #[error(
    "disruptive change on node '{node}' requires confirmation (attributes: {})",
    .attributes.join(", ")
  )]
  DisruptiveChange {
    node: String,
    attributes: Vec<String>,
  },

  /// The external function reported a definite failure.
  #[error("external function failed for node '{node}': {source}")]
  ExternalFailed {
    node: String,
    #[source]
    source: ExternalError,
  },

  /// The external function timed out and its result state is unknown.
  ///
  /// Deliberately distinct from [`EngineError::ExternalFailed`]: the call
  /// may have succeeded on the far side. Reconcile before retrying.
  #[error(
    "external function timed out for node '{node}' after {attempts} attempt(s); result state unknown"
  )]
  ExternalTimedOut { node: String, attempts: u32 },

  /// No function is registered under the name a node declares.
  #[error("no external function registered under '{function}' for node '{node}'")]
  UnknownFunction { node: String, function: String },

  /// Secret store failure while resolving or writing a node's secrets.
  #[error("secret error for node '{node}': {source}")]
  Secret {
    node: String,
    #[source]
    source: SecretError,
  },

  /// Service endpoint resolution failure.
  #[error("endpoint resolution failed for node '{node}': {source}")]
  Endpoint {
    node: String,
    #[source]
    source: RegistryError,
  },

  /// The run was cancelled by the operator.
  #[error("apply cancelled")]
  Cancelled,

  /// Structural graph error surfaced at execution time.
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// A spawned provisioning task died.
  #[error("internal engine error: {message}")]
  Internal { message: String },
}
