//! Strata Resolver
//!
//! Transforms a [`DeploymentDef`] into a validated [`DependencyGraph`].
//!
//! This process:
//! 1. Registers every resource in declaration order
//! 2. Adds explicit `depends_on` edges
//! 3. Implies an edge for every input reference: an output reference
//!    points at the producing node, a service reference at the node
//!    exposing it, and a reference to an externally-computed secret at the
//!    function node that writes it
//! 4. Validates the result (cycle detection), so no partial graph ever
//!    reaches the engine

mod error;

pub use error::ResolveError;

use std::collections::HashMap;

use strata_config::{
  AttrValue, DeploymentDef, GenerationPolicy, ResourceDef, ResourceType,
};
use strata_graph::{DependencyGraph, ExternalFunctionSpec, Node, NodeType};

/// Build the dependency graph for a deployment definition.
pub fn build_graph(def: &DeploymentDef) -> Result<DependencyGraph, ResolveError> {
  let secrets = index_secrets(def)?;
  let services = index_services(def)?;
  let producers = index_producers(def, &secrets)?;

  let mut graph = DependencyGraph::new();
  for resource in &def.resources {
    graph.add_node(to_node(resource))?;
  }

  for resource in &def.resources {
    for dep in &resource.depends_on {
      graph.add_edge(&resource.name, dep)?;
    }

    for value in resource.inputs.values() {
      match value {
        AttrValue::Output { node, .. } => {
          graph.add_edge(&resource.name, node)?;
        }
        AttrValue::Endpoint { service } => {
          let owner =
            services
              .get(service.as_str())
              .ok_or_else(|| ResolveError::UnknownService {
                node: resource.name.clone(),
                service: service.clone(),
              })?;
          if *owner != resource.name {
            graph.add_edge(&resource.name, owner)?;
          }
        }
        AttrValue::Secret { secret } => {
          let policy =
            secrets
              .get(secret.as_str())
              .ok_or_else(|| ResolveError::UnknownSecret {
                node: resource.name.clone(),
                secret: secret.clone(),
              })?;
          if matches!(policy, GenerationPolicy::ExternallyComputed) {
            let producer =
              producers
                .get(secret.as_str())
                .ok_or_else(|| ResolveError::UnproducedSecret {
                  node: resource.name.clone(),
                  secret: secret.clone(),
                })?;
            if *producer != resource.name {
              graph.add_edge(&resource.name, producer)?;
            }
          }
        }
        AttrValue::Literal(_) => {}
      }
    }
  }

  graph.validate()?;
  Ok(graph)
}

/// Secret name to generation policy, as declared in the definition.
///
/// The engine resolves secret references against this table at provisioning
/// time.
pub fn secret_policies(def: &DeploymentDef) -> HashMap<String, GenerationPolicy> {
  def
    .secrets
    .iter()
    .map(|s| (s.name.clone(), s.policy.clone()))
    .collect()
}

fn index_secrets(def: &DeploymentDef) -> Result<HashMap<&str, &GenerationPolicy>, ResolveError> {
  let mut secrets = HashMap::new();
  for secret in &def.secrets {
    if secrets.insert(secret.name.as_str(), &secret.policy).is_some() {
      return Err(ResolveError::DuplicateSecret {
        name: secret.name.clone(),
      });
    }
  }
  Ok(secrets)
}

fn index_services(def: &DeploymentDef) -> Result<HashMap<&str, &str>, ResolveError> {
  let mut services: HashMap<&str, &str> = HashMap::new();
  for resource in &def.resources {
    if let Some(expose) = &resource.expose {
      if let Some(first) = services.insert(expose.service.as_str(), resource.name.as_str()) {
        return Err(ResolveError::DuplicateService {
          service: expose.service.clone(),
          first: first.to_string(),
          second: resource.name.clone(),
        });
      }
    }
  }
  Ok(services)
}

fn index_producers<'a>(
  def: &'a DeploymentDef,
  secrets: &HashMap<&str, &GenerationPolicy>,
) -> Result<HashMap<&'a str, &'a str>, ResolveError> {
  let mut producers: HashMap<&str, &str> = HashMap::new();
  for resource in &def.resources {
    if let ResourceType::ExternalFunction { target_secret, .. } = &resource.ty {
      match secrets.get(target_secret.as_str()) {
        None => {
          return Err(ResolveError::UnknownSecret {
            node: resource.name.clone(),
            secret: target_secret.clone(),
          });
        }
        Some(GenerationPolicy::ExternallyComputed) => {}
        Some(_) => {
          return Err(ResolveError::NotExternallyComputed {
            node: resource.name.clone(),
            secret: target_secret.clone(),
          });
        }
      }
      if let Some(first) = producers.insert(target_secret.as_str(), resource.name.as_str()) {
        return Err(ResolveError::DuplicateProducer {
          secret: target_secret.clone(),
          first: first.to_string(),
          second: resource.name.clone(),
        });
      }
    }
  }
  Ok(producers)
}

fn to_node(resource: &ResourceDef) -> Node {
  let ty = match &resource.ty {
    ResourceType::Resource { kind } => NodeType::Resource { kind: *kind },
    ResourceType::ExternalFunction {
      function,
      target_secret,
      payload,
      timeout_ms,
      max_attempts,
    } => NodeType::ExternalFunction(ExternalFunctionSpec {
      function: function.clone(),
      target_secret: target_secret.clone(),
      payload: payload.clone(),
      timeout_ms: *timeout_ms,
      max_attempts: *max_attempts,
    }),
  };

  Node {
    name: resource.name.clone(),
    ty,
    inputs: resource.inputs.clone(),
    replace_triggers: resource.replace_triggers.clone(),
    expose: resource.expose.clone(),
  }
}
