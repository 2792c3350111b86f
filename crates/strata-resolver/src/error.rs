use strata_graph::GraphError;
use thiserror::Error;

/// Errors that can occur while turning a deployment definition into a
/// dependency graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
  /// Structural graph error (duplicate identity, unknown node, cycle).
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// Two secret declarations share a name.
  #[error("duplicate secret declaration: '{name}'")]
  DuplicateSecret { name: String },

  /// Two nodes expose the same service name.
  #[error("service '{service}' exposed by both '{first}' and '{second}'")]
  DuplicateService {
    service: String,
    first: String,
    second: String,
  },

  /// Two external-function nodes target the same secret.
  #[error("secret '{secret}' targeted by both '{first}' and '{second}'")]
  DuplicateProducer {
    secret: String,
    first: String,
    second: String,
  },

  /// An input references a secret that was never declared.
  #[error("node '{node}' references undeclared secret '{secret}'")]
  UnknownSecret { node: String, secret: String },

  /// An input references a service no node exposes.
  #[error("node '{node}' references service '{service}' that no node exposes")]
  UnknownService { node: String, service: String },

  /// An external function targets a secret whose policy is not
  /// externally-computed.
  #[error("node '{node}' targets secret '{secret}' whose policy is not externally computed")]
  NotExternallyComputed { node: String, secret: String },

  /// An externally-computed secret is consumed but no function produces it.
  #[error("node '{node}' consumes secret '{secret}' but no external function targets it")]
  UnproducedSecret { node: String, secret: String },
}
