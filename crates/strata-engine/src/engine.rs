//! Graph execution.
//!
//! The `ProvisioningEngine` walks a validated dependency graph in waves:
//! every node whose dependencies have all reached Ready is spawned
//! concurrently (bounded by a semaphore), the wave is joined, and the next
//! wave is collected. A node failure drains the in-flight wave and then
//! halts: dependents of a failed node are never attempted, and already
//! Ready nodes are never rolled back. Re-applying converges instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use strata_config::{AttrValue, EngineSettings, GenerationPolicy};
use strata_graph::{DependencyGraph, Node, NodeState, NodeType};
use strata_registry::{Endpoint, ServiceRegistry};
use strata_secrets::{SecretError, SecretStore};

use crate::error::EngineError;
use crate::events::{ApplyEvent, ApplyNotifier, NoopNotifier};
use crate::external::{CustomResourceRunner, ExternalFunction, Invocation, InvocationError};
use crate::plan::{Decision, PAYLOAD_KEY, PriorRecord, PriorState, decide};
use crate::provider::{Outputs, ResolvedInputs, ResourceProvider};

/// What it took to bring a node to Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedAction {
  Created,
  Updated,
  /// Destroyed and recreated after a confirmed disruptive change.
  Replaced,
  /// Inputs matched the prior record; zero driver calls.
  Unchanged,
  /// External function invoked and its result stored.
  Invoked,
}

/// Engine-level options for one run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub max_concurrency: usize,
  /// Confirmation flag for destroy-and-recreate changes.
  pub allow_disruptive: bool,
  pub external_timeout: Duration,
  pub external_attempts: u32,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      max_concurrency: 4,
      allow_disruptive: false,
      external_timeout: Duration::from_secs(30),
      external_attempts: 2,
    }
  }
}

impl EngineOptions {
  /// Options carried in the deployment definition; `allow_disruptive`
  /// stays off until the operator confirms explicitly.
  pub fn from_settings(settings: &EngineSettings) -> Self {
    Self {
      max_concurrency: settings.max_concurrency.max(1),
      allow_disruptive: false,
      external_timeout: Duration::from_millis(settings.external_timeout_ms),
      external_attempts: settings.external_attempts,
    }
  }
}

/// Everything one apply run reads and writes besides the graph itself.
///
/// Constructed by the caller and passed in explicitly; the engine holds no
/// ambient state.
pub struct ApplyContext {
  pub deployment: String,
  pub prior: PriorState,
  pub policies: HashMap<String, GenerationPolicy>,
  pub secrets: Arc<SecretStore>,
  pub registry: Arc<ServiceRegistry>,
}

/// How the run ended.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
  /// Every node reached Ready.
  Converged,
  /// A node failed; dependents were left Pending.
  Halted { node: String, error: EngineError },
  /// The operator aborted; in-flight nodes stay Provisioning.
  Cancelled,
}

/// The observable result of a run: state transitions and output
/// attributes, plus the resolved inputs needed to diff the next run.
#[derive(Debug)]
pub struct ApplyReport {
  pub apply_id: String,
  pub outcome: ApplyOutcome,
  pub states: HashMap<String, NodeState>,
  pub actions: HashMap<String, AppliedAction>,
  pub outputs: HashMap<String, Outputs>,
  pub resolved_inputs: HashMap<String, ResolvedInputs>,
}

impl ApplyReport {
  pub fn is_converged(&self) -> bool {
    matches!(self.outcome, ApplyOutcome::Converged)
  }

  pub fn state(&self, node: &str) -> Option<NodeState> {
    self.states.get(node).copied()
  }
}

/// Result of a teardown pass.
#[derive(Debug)]
pub struct TeardownReport {
  pub apply_id: String,
  pub outcome: ApplyOutcome,
  /// Nodes whose resources were destroyed, in destruction order.
  pub deleted: Vec<String>,
  pub deleted_secrets: Vec<String>,
}

/// The provisioning engine.
///
/// Generic over `N: ApplyNotifier` to allow different observation
/// strategies; use `ProvisioningEngine::new()` for a no-op notifier.
pub struct ProvisioningEngine<N: ApplyNotifier = NoopNotifier> {
  provider: Arc<dyn ResourceProvider>,
  functions: HashMap<String, Arc<dyn ExternalFunction>>,
  options: EngineOptions,
  notifier: N,
}

impl ProvisioningEngine<NoopNotifier> {
  pub fn new(provider: Arc<dyn ResourceProvider>, options: EngineOptions) -> Self {
    Self::with_notifier(provider, options, NoopNotifier)
  }
}

impl<N: ApplyNotifier> ProvisioningEngine<N> {
  pub fn with_notifier(
    provider: Arc<dyn ResourceProvider>,
    options: EngineOptions,
    notifier: N,
  ) -> Self {
    Self {
      provider,
      functions: HashMap::new(),
      options,
      notifier,
    }
  }

  /// Register an external function under the name deployment definitions
  /// refer to it by.
  pub fn register_function(&mut self, name: impl Into<String>, function: Arc<dyn ExternalFunction>) {
    self.functions.insert(name.into(), function);
  }

  /// Converge actual state toward the declared graph.
  #[instrument(
    name = "engine_apply",
    skip(self, graph, ctx, cancel),
    fields(deployment = %ctx.deployment)
  )]
  pub async fn apply(
    &self,
    graph: &DependencyGraph,
    ctx: &ApplyContext,
    cancel: CancellationToken,
  ) -> Result<ApplyReport, EngineError> {
    let apply_id = uuid::Uuid::new_v4().to_string();

    // Construction errors are fatal before any provisioning begins.
    let order = graph.topological_order()?;
    self.check_functions(graph)?;

    info!(
      apply_id = %apply_id,
      deployment = %ctx.deployment,
      nodes = order.len(),
      "apply_started"
    );
    self.notifier.notify(ApplyEvent::ApplyStarted {
      apply_id: apply_id.clone(),
      deployment: ctx.deployment.clone(),
    });

    let mut states: HashMap<String, NodeState> = order
      .iter()
      .map(|n| (n.clone(), NodeState::Pending))
      .collect();
    let mut actions: HashMap<String, AppliedAction> = HashMap::new();
    let mut outputs: HashMap<String, Outputs> = HashMap::new();
    let mut resolved_inputs: HashMap<String, ResolvedInputs> = HashMap::new();
    let mut outcome = ApplyOutcome::Converged;

    let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency));

    'waves: loop {
      if cancel.is_cancelled() {
        outcome = ApplyOutcome::Cancelled;
        break;
      }

      let ready = self.find_ready_nodes(graph, &order, &states);
      if ready.is_empty() {
        break;
      }

      // All dependencies are Ready, so references resolve now: this is
      // the moment consumers observe the latest secret versions. The whole
      // wave resolves before anything spawns, so a resolution failure
      // halts with no operation in flight.
      let mut prepared = Vec::with_capacity(ready.len());
      for name in &ready {
        let node = graph.get(name).expect("ordered node is registered").clone();
        match resolve_inputs(&node, &outputs, ctx) {
          Ok(resolved) => prepared.push((node, resolved)),
          Err(e) => {
            states.insert(name.clone(), NodeState::Failed);
            error!(apply_id = %apply_id, node = %name, error = %e, "node_failed");
            self.notifier.notify(ApplyEvent::NodeFailed {
              apply_id: apply_id.clone(),
              node: name.clone(),
              error: e.to_string(),
            });
            outcome = ApplyOutcome::Halted {
              node: name.clone(),
              error: e,
            };
            break 'waves;
          }
        }
      }

      let mut handles = Vec::with_capacity(prepared.len());
      for (node, resolved) in prepared {
        let name = &node.name;
        states.insert(name.clone(), NodeState::Provisioning);
        info!(apply_id = %apply_id, node = %name, "node_started");
        self.notifier.notify(ApplyEvent::NodeStarted {
          apply_id: apply_id.clone(),
          node: name.clone(),
        });

        let task = NodeTask {
          provider: self.provider.clone(),
          function: function_for(&self.functions, &node),
          prior: ctx.prior.get(name).cloned(),
          secrets: ctx.secrets.clone(),
          allow_disruptive: self.options.allow_disruptive,
          external_timeout: self.options.external_timeout,
          external_attempts: self.options.external_attempts,
          semaphore: semaphore.clone(),
        };
        handles.push(tokio::spawn(provision_node(node, resolved, task)));
      }

      // A cancellation mid-wave abandons the join: in-flight operations
      // run to completion on their own tasks, and their nodes stay in
      // Provisioning for the next run to re-resolve.
      let results = tokio::select! {
        results = join_all(handles) => results,
        _ = cancel.cancelled() => {
          outcome = ApplyOutcome::Cancelled;
          break 'waves;
        }
      };

      for result in results {
        let node_result = result.map_err(|e| EngineError::Internal {
          message: format!("provisioning task panicked: {}", e),
        })?;

        match node_result {
          Ok(done) => {
            if let Err(e) = register_endpoint(graph, &done, ctx.registry.as_ref()) {
              states.insert(done.name.clone(), NodeState::Failed);
              error!(apply_id = %apply_id, node = %done.name, error = %e, "node_failed");
              self.notifier.notify(ApplyEvent::NodeFailed {
                apply_id: apply_id.clone(),
                node: done.name.clone(),
                error: e.to_string(),
              });
              if !matches!(outcome, ApplyOutcome::Halted { .. }) {
                outcome = ApplyOutcome::Halted {
                  node: done.name.clone(),
                  error: e,
                };
              }
              continue;
            }

            states.insert(done.name.clone(), NodeState::Ready);
            info!(
              apply_id = %apply_id,
              node = %done.name,
              action = ?done.action,
              "node_ready"
            );
            self.notifier.notify(ApplyEvent::NodeReady {
              apply_id: apply_id.clone(),
              node: done.name.clone(),
              action: done.action,
              outputs: done.outputs.clone(),
            });
            actions.insert(done.name.clone(), done.action);
            outputs.insert(done.name.clone(), done.outputs);
            resolved_inputs.insert(done.name, done.resolved);
          }
          Err(failed) => {
            states.insert(failed.name.clone(), NodeState::Failed);
            error!(
              apply_id = %apply_id,
              node = %failed.name,
              error = %failed.error,
              "node_failed"
            );
            self.notifier.notify(ApplyEvent::NodeFailed {
              apply_id: apply_id.clone(),
              node: failed.name.clone(),
              error: failed.error.to_string(),
            });
            if !matches!(outcome, ApplyOutcome::Halted { .. }) {
              outcome = ApplyOutcome::Halted {
                node: failed.name,
                error: failed.error,
              };
            }
          }
        }
      }

      if matches!(outcome, ApplyOutcome::Halted { .. }) {
        break;
      }
    }

    match &outcome {
      ApplyOutcome::Converged => {
        info!(apply_id = %apply_id, "apply_completed");
        self.notifier.notify(ApplyEvent::ApplyCompleted {
          apply_id: apply_id.clone(),
        });
      }
      ApplyOutcome::Halted { node, error } => {
        error!(apply_id = %apply_id, node = %node, error = %error, "apply_halted");
        self.notifier.notify(ApplyEvent::ApplyHalted {
          apply_id: apply_id.clone(),
          node: node.clone(),
          error: error.to_string(),
        });
      }
      ApplyOutcome::Cancelled => {
        warn!(apply_id = %apply_id, "apply_cancelled");
        self.notifier.notify(ApplyEvent::ApplyCancelled {
          apply_id: apply_id.clone(),
        });
      }
    }

    Ok(ApplyReport {
      apply_id,
      outcome,
      states,
      actions,
      outputs,
      resolved_inputs,
    })
  }

  /// Destroy previously provisioned resources in reverse dependency order,
  /// then drop the secrets. The only path that destroys anything.
  #[instrument(
    name = "engine_teardown",
    skip(self, graph, ctx, cancel),
    fields(deployment = %ctx.deployment)
  )]
  pub async fn teardown(
    &self,
    graph: &DependencyGraph,
    ctx: &ApplyContext,
    cancel: CancellationToken,
  ) -> Result<TeardownReport, EngineError> {
    let apply_id = uuid::Uuid::new_v4().to_string();
    let mut order = graph.topological_order()?;
    order.reverse();

    info!(apply_id = %apply_id, deployment = %ctx.deployment, "teardown_started");

    let mut deleted = Vec::new();
    let mut outcome = ApplyOutcome::Converged;

    for name in &order {
      if cancel.is_cancelled() {
        outcome = ApplyOutcome::Cancelled;
        break;
      }

      let node = graph.get(name).expect("ordered node is registered");
      let Some(record) = ctx.prior.get(name) else {
        continue;
      };

      if let NodeType::Resource { kind } = &node.ty {
        if let Err(e) = self.provider.delete(name, *kind, &record.outputs).await {
          let error = EngineError::ProvisioningFailed {
            node: name.clone(),
            source: e,
          };
          error!(apply_id = %apply_id, node = %name, error = %error, "teardown_halted");
          outcome = ApplyOutcome::Halted {
            node: name.clone(),
            error,
          };
          break;
        }
      }
      // External function nodes leave nothing behind but their secret,
      // which is dropped with the rest below.

      info!(apply_id = %apply_id, node = %name, "node_deleted");
      self.notifier.notify(ApplyEvent::NodeDeleted {
        apply_id: apply_id.clone(),
        node: name.clone(),
      });
      deleted.push(name.clone());
    }

    let deleted_secrets: Vec<String> = if matches!(outcome, ApplyOutcome::Converged) {
      ctx
        .policies
        .keys()
        .filter(|name| ctx.secrets.remove(name))
        .cloned()
        .collect()
    } else {
      Vec::new()
    };

    match &outcome {
      ApplyOutcome::Converged => {
        info!(apply_id = %apply_id, "teardown_completed");
        self.notifier.notify(ApplyEvent::ApplyCompleted {
          apply_id: apply_id.clone(),
        });
      }
      ApplyOutcome::Halted { node, error } => {
        self.notifier.notify(ApplyEvent::ApplyHalted {
          apply_id: apply_id.clone(),
          node: node.clone(),
          error: error.to_string(),
        });
      }
      ApplyOutcome::Cancelled => {
        self.notifier.notify(ApplyEvent::ApplyCancelled {
          apply_id: apply_id.clone(),
        });
      }
    }

    Ok(TeardownReport {
      apply_id,
      outcome,
      deleted,
      deleted_secrets,
    })
  }

  /// Nodes whose dependencies have all reached Ready, in declaration
  /// order.
  fn find_ready_nodes(
    &self,
    graph: &DependencyGraph,
    order: &[String],
    states: &HashMap<String, NodeState>,
  ) -> Vec<String> {
    order
      .iter()
      .filter(|name| states.get(*name) == Some(&NodeState::Pending))
      .filter(|name| {
        graph
          .dependencies(name)
          .iter()
          .all(|dep| states.get(dep) == Some(&NodeState::Ready))
      })
      .cloned()
      .collect()
  }

  /// Every external-function node must resolve to a registered function
  /// before anything is provisioned.
  fn check_functions(&self, graph: &DependencyGraph) -> Result<(), EngineError> {
    for node in graph.nodes() {
      if let NodeType::ExternalFunction(spec) = &node.ty {
        if !self.functions.contains_key(&spec.function) {
          return Err(EngineError::UnknownFunction {
            node: node.name.clone(),
            function: spec.function.clone(),
          });
        }
      }
    }
    Ok(())
  }
}

fn function_for(
  functions: &HashMap<String, Arc<dyn ExternalFunction>>,
  node: &Node,
) -> Option<Arc<dyn ExternalFunction>> {
  match &node.ty {
    NodeType::ExternalFunction(spec) => functions.get(&spec.function).cloned(),
    NodeType::Resource { .. } => None,
  }
}

/// Resolve a node's declared inputs into concrete values.
///
/// Only called once every dependency is Ready, so output lookups cannot
/// race their producers.
fn resolve_inputs(
  node: &Node,
  completed: &HashMap<String, Outputs>,
  ctx: &ApplyContext,
) -> Result<ResolvedInputs, EngineError> {
  let mut resolved = ResolvedInputs::new();

  for (attr, value) in &node.inputs {
    let concrete = match value {
      AttrValue::Literal(v) => v.clone(),
      AttrValue::Output { node: source, output } => completed
        .get(source)
        .and_then(|outputs| outputs.get(output))
        .cloned()
        .ok_or_else(|| EngineError::InputResolution {
          node: node.name.clone(),
          message: format!("node '{}' has no output '{}'", source, output),
        })?,
      AttrValue::Secret { secret } => {
        let policy = ctx
          .policies
          .get(secret)
          .ok_or_else(|| EngineError::InputResolution {
            node: node.name.clone(),
            message: format!("secret '{}' is not declared", secret),
          })?;
        let value = ctx
          .secrets
          .ensure(secret, policy)
          .map_err(|e| EngineError::Secret {
            node: node.name.clone(),
            source: e,
          })?
          .ok_or_else(|| EngineError::Secret {
            node: node.name.clone(),
            source: SecretError::Unset {
              name: secret.clone(),
            },
          })?;
        serde_json::Value::String(value)
      }
      AttrValue::Endpoint { service } => {
        let endpoint = ctx
          .registry
          .resolve(service)
          .map_err(|e| EngineError::Endpoint {
            node: node.name.clone(),
            source: e,
          })?;
        serde_json::Value::String(endpoint.to_string())
      }
    };
    resolved.insert(attr.clone(), concrete);
  }

  if let NodeType::ExternalFunction(spec) = &node.ty {
    resolved.insert(PAYLOAD_KEY.to_string(), spec.payload.clone());
  }
  Ok(resolved)
}

/// Publish the node's endpoint once it is Ready, if it exposes a service.
fn register_endpoint(
  graph: &DependencyGraph,
  done: &NodeSuccess,
  registry: &ServiceRegistry,
) -> Result<(), EngineError> {
  let node = graph.get(&done.name).expect("completed node is registered");
  let Some(expose) = &node.expose else {
    return Ok(());
  };

  let host = done
    .outputs
    .get("host")
    .and_then(|v| v.as_str())
    .ok_or_else(|| EngineError::InputResolution {
      node: done.name.clone(),
      message: format!(
        "exposing service '{}' requires a string 'host' output",
        expose.service
      ),
    })?;
  let port = done
    .outputs
    .get("port")
    .and_then(|v| v.as_u64())
    .and_then(|p| u16::try_from(p).ok())
    .ok_or_else(|| EngineError::InputResolution {
      node: done.name.clone(),
      message: format!(
        "exposing service '{}' requires a port output in 0..=65535",
        expose.service
      ),
    })?;

  registry.register(
    &expose.service,
    Endpoint {
      host: host.to_string(),
      port,
    },
    Duration::from_secs(expose.ttl_secs),
  );
  info!(node = %done.name, service = %expose.service, "service_registered");
  Ok(())
}

/// Everything a spawned provisioning task needs (prepared on the engine's
/// task, moved into the spawn).
struct NodeTask {
  provider: Arc<dyn ResourceProvider>,
  function: Option<Arc<dyn ExternalFunction>>,
  prior: Option<PriorRecord>,
  secrets: Arc<SecretStore>,
  allow_disruptive: bool,
  external_timeout: Duration,
  external_attempts: u32,
  semaphore: Arc<Semaphore>,
}

struct NodeSuccess {
  name: String,
  action: AppliedAction,
  outputs: Outputs,
  resolved: ResolvedInputs,
}

struct NodeFailure {
  name: String,
  error: EngineError,
}

/// Execute one node to a definite outcome.
async fn provision_node(
  node: Node,
  resolved: ResolvedInputs,
  task: NodeTask,
) -> Result<NodeSuccess, NodeFailure> {
  let name = node.name.clone();

  let _permit = task
    .semaphore
    .clone()
    .acquire_owned()
    .await
    .map_err(|_| NodeFailure {
      name: name.clone(),
      error: EngineError::Internal {
        message: "concurrency limiter closed".to_string(),
      },
    })?;

  let result: Result<(AppliedAction, Outputs), EngineError> = match &node.ty {
    NodeType::Resource { kind } => {
      match decide(task.prior.as_ref(), &resolved, &node.replace_triggers) {
        Decision::Noop => {
          let prior = task.prior.as_ref().expect("noop requires a prior record");
          Ok((AppliedAction::Unchanged, prior.outputs.clone()))
        }
        Decision::Create => task
          .provider
          .create(&name, *kind, &resolved)
          .await
          .map(|outputs| (AppliedAction::Created, outputs))
          .map_err(|e| EngineError::ProvisioningFailed {
            node: name.clone(),
            source: e,
          }),
        Decision::Update => {
          let prior = task.prior.as_ref().expect("update requires a prior record");
          task
            .provider
            .update(&name, *kind, &resolved, &prior.outputs)
            .await
            .map(|outputs| (AppliedAction::Updated, outputs))
            .map_err(|e| EngineError::ProvisioningFailed {
              node: name.clone(),
              source: e,
            })
        }
        Decision::Replace { attributes } => {
          if !task.allow_disruptive {
            Err(EngineError::DisruptiveChange {
              node: name.clone(),
              attributes,
            })
          } else {
            let prior = task
              .prior
              .as_ref()
              .expect("replace requires a prior record");
            replace_resource(&task, &node, *kind, &resolved, prior).await
          }
        }
      }
    }
    NodeType::ExternalFunction(spec) => {
      match decide(task.prior.as_ref(), &resolved, &[]) {
        Decision::Noop => {
          let prior = task.prior.as_ref().expect("noop requires a prior record");
          Ok((AppliedAction::Unchanged, prior.outputs.clone()))
        }
        _ => {
          let function = task.function.clone().ok_or_else(|| EngineError::Internal {
            message: format!("function '{}' vanished after pre-check", spec.function),
          })?;
          let runner = CustomResourceRunner::new(function);
          let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(task.external_timeout);
          let attempts = spec.max_attempts.unwrap_or(task.external_attempts);
          let invocation = Invocation::new(spec.payload.clone(), timeout, attempts);

          match runner
            .run(&invocation, &task.secrets, &spec.target_secret)
            .await
          {
            Ok(version) => {
              let mut outputs = Outputs::new();
              outputs.insert(
                "secret".to_string(),
                serde_json::Value::String(spec.target_secret.clone()),
              );
              outputs.insert("version".to_string(), serde_json::Value::from(version));
              Ok((AppliedAction::Invoked, outputs))
            }
            Err(InvocationError::Failed(e)) => Err(EngineError::ExternalFailed {
              node: name.clone(),
              source: e,
            }),
            Err(InvocationError::TimedOut { attempts }) => Err(EngineError::ExternalTimedOut {
              node: name.clone(),
              attempts,
            }),
            Err(InvocationError::Secret(e)) => Err(EngineError::Secret {
              node: name.clone(),
              source: e,
            }),
          }
        }
      }
    }
  };

  match result {
    Ok((action, outputs)) => Ok(NodeSuccess {
      name,
      action,
      outputs,
      resolved,
    }),
    Err(error) => Err(NodeFailure { name, error }),
  }
}

/// Confirmed disruptive change: destroy the old resource, then create the
/// replacement.
async fn replace_resource(
  task: &NodeTask,
  node: &Node,
  kind: strata_config::ResourceKind,
  resolved: &ResolvedInputs,
  prior: &PriorRecord,
) -> Result<(AppliedAction, Outputs), EngineError> {
  warn!(node = %node.name, "disruptive_replacement");
  task
    .provider
    .delete(&node.name, kind, &prior.outputs)
    .await
    .map_err(|e| EngineError::ProvisioningFailed {
      node: node.name.clone(),
      source: e,
    })?;
  task
    .provider
    .create(&node.name, kind, resolved)
    .await
    .map(|outputs| (AppliedAction::Replaced, outputs))
    .map_err(|e| EngineError::ProvisioningFailed {
      node: node.name.clone(),
      source: e,
    })
}
