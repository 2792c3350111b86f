//! Integration tests for strata-engine using a recording fake driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use strata_config::{DeploymentDef, ResourceKind};
use strata_engine::{
  AppliedAction, ApplyContext, ApplyOutcome, ApplyReport, EngineError, EngineOptions,
  ExternalError, ExternalFunction, Outputs, PriorRecord, PriorState, ProviderError,
  ProvisioningEngine, ResolvedInputs, ResourceProvider,
};
use strata_graph::NodeState;
use strata_registry::ServiceRegistry;
use strata_resolver::{build_graph, secret_policies};
use strata_secrets::SecretStore;

#[derive(Debug, Clone, PartialEq)]
enum Call {
  Create(String),
  Update(String),
  Delete(String),
}

/// Recording driver: fabricates stable outputs, optionally fails or stalls
/// on chosen nodes, and tracks peak concurrency.
#[derive(Default)]
struct FakeProvider {
  calls: Mutex<Vec<Call>>,
  fail_on: Vec<String>,
  delay: Option<Duration>,
  in_flight: AtomicUsize,
  peak_in_flight: AtomicUsize,
}

impl FakeProvider {
  fn failing_on(name: &str) -> Self {
    Self {
      fail_on: vec![name.to_string()],
      ..Self::default()
    }
  }

  fn with_delay(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  fn outputs_for(name: &str, inputs: &ResolvedInputs) -> Outputs {
    let port = inputs.get("port").and_then(|v| v.as_u64()).unwrap_or(8080);
    let mut outputs = Outputs::new();
    outputs.insert("host".to_string(), json!(format!("{name}.svc.internal")));
    outputs.insert("port".to_string(), json!(port));
    outputs
  }

  async fn enter(&self, name: &str) -> Result<(), ProviderError> {
    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    if self.fail_on.iter().any(|n| n == name) {
      return Err(ProviderError::new(format!("driver rejected '{name}'")));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceProvider for FakeProvider {
  async fn create(
    &self,
    name: &str,
    _kind: ResourceKind,
    inputs: &ResolvedInputs,
  ) -> Result<Outputs, ProviderError> {
    self.calls.lock().unwrap().push(Call::Create(name.to_string()));
    self.enter(name).await?;
    Ok(Self::outputs_for(name, inputs))
  }

  async fn update(
    &self,
    name: &str,
    _kind: ResourceKind,
    inputs: &ResolvedInputs,
    _prior_outputs: &Outputs,
  ) -> Result<Outputs, ProviderError> {
    self.calls.lock().unwrap().push(Call::Update(name.to_string()));
    self.enter(name).await?;
    Ok(Self::outputs_for(name, inputs))
  }

  async fn delete(
    &self,
    name: &str,
    _kind: ResourceKind,
    _outputs: &Outputs,
  ) -> Result<(), ProviderError> {
    self.calls.lock().unwrap().push(Call::Delete(name.to_string()));
    self.enter(name).await
  }
}

/// External function returning a fixed derived value.
struct StaticKeyFunction;

#[async_trait]
impl ExternalFunction for StaticKeyFunction {
  async fn invoke(
    &self,
    _payload: &serde_json::Value,
    _token: &str,
  ) -> Result<String, ExternalError> {
    Ok("derived-key-material".to_string())
  }
}

fn context(def: &DeploymentDef, prior: PriorState, secrets: Arc<SecretStore>) -> ApplyContext {
  ApplyContext {
    deployment: def.name.clone(),
    prior,
    policies: secret_policies(def),
    secrets,
    registry: Arc::new(ServiceRegistry::new()),
  }
}

/// Turn one run's report into the prior state a next run would load.
fn report_to_prior(report: &ApplyReport) -> PriorState {
  report
    .states
    .iter()
    .filter_map(|(name, state)| {
      let inputs = report.resolved_inputs.get(name)?;
      let outputs = report.outputs.get(name)?;
      Some((
        name.clone(),
        PriorRecord {
          inputs: inputs.clone(),
          outputs: outputs.clone(),
          state: *state,
        },
      ))
    })
    .collect()
}

fn web_and_database() -> DeploymentDef {
  serde_json::from_value(json!({
    "name": "platform",
    "resources": [
      {
        "name": "web",
        "type": "resource",
        "kind": "compute-task",
        "inputs": {
          "DATABASE_HOST": { "node": "database", "output": "host" }
        }
      },
      {
        "name": "database",
        "type": "resource",
        "kind": "database",
        "inputs": { "port": 5432 }
      }
    ]
  }))
  .unwrap()
}

#[tokio::test]
async fn apply_converges_in_dependency_order() {
  let def = web_and_database();
  let graph = build_graph(&def).unwrap();
  let provider = Arc::new(FakeProvider::default());
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));

  let report = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_converged());
  assert_eq!(report.state("web"), Some(NodeState::Ready));
  assert_eq!(report.state("database"), Some(NodeState::Ready));
  assert_eq!(report.actions["web"], AppliedAction::Created);
  assert_eq!(
    provider.calls(),
    vec![
      Call::Create("database".to_string()),
      Call::Create("web".to_string())
    ]
  );
  // The dependent saw the dependency's output.
  assert_eq!(
    report.resolved_inputs["web"]["DATABASE_HOST"],
    json!("database.svc.internal")
  );
}

#[tokio::test]
async fn reapplying_a_ready_graph_is_a_noop() {
  let def = web_and_database();
  let graph = build_graph(&def).unwrap();
  let provider = Arc::new(FakeProvider::default());
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  let provider2 = Arc::new(FakeProvider::default());
  let engine2 = ProvisioningEngine::new(provider2.clone(), EngineOptions::default());
  let ctx2 = context(&def, report_to_prior(&first), Arc::new(SecretStore::new()));
  let second = engine2
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();

  assert!(second.is_converged());
  assert!(provider2.calls().is_empty(), "no-op must make zero driver calls");
  assert_eq!(second.actions["web"], AppliedAction::Unchanged);
  assert_eq!(second.actions["database"], AppliedAction::Unchanged);
  assert_eq!(second.outputs["database"], first.outputs["database"]);
}

#[tokio::test]
async fn changed_inputs_update_in_place() {
  let def = web_and_database();
  let graph = build_graph(&def).unwrap();
  let provider = Arc::new(FakeProvider::default());
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  // Same deployment, new database port.
  let mut changed = web_and_database();
  changed.resources[1]
    .inputs
    .insert("port".to_string(), serde_json::from_value(json!(5433)).unwrap());
  let graph = build_graph(&changed).unwrap();

  let provider2 = Arc::new(FakeProvider::default());
  let engine2 = ProvisioningEngine::new(provider2.clone(), EngineOptions::default());
  let ctx2 = context(&changed, report_to_prior(&first), Arc::new(SecretStore::new()));
  let second = engine2
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();

  assert!(second.is_converged());
  assert_eq!(second.actions["database"], AppliedAction::Updated);
  // The dependent's resolved host is unchanged, so it stays a no-op.
  assert_eq!(second.actions["web"], AppliedAction::Unchanged);
  assert_eq!(
    provider2.calls(),
    vec![Call::Update("database".to_string())]
  );
}

#[tokio::test]
async fn failed_dependency_halts_and_dependents_stay_pending() {
  let def = web_and_database();
  let graph = build_graph(&def).unwrap();
  let provider = Arc::new(FakeProvider::failing_on("database"));
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));

  let report = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  match &report.outcome {
    ApplyOutcome::Halted { node, error } => {
      assert_eq!(node, "database");
      assert!(matches!(error, EngineError::ProvisioningFailed { .. }));
    }
    other => panic!("expected halt, got: {:?}", other),
  }
  assert_eq!(report.state("database"), Some(NodeState::Failed));
  assert_eq!(report.state("web"), Some(NodeState::Pending));
  // Exactly one failure; the dependent was never attempted.
  let failed = report
    .states
    .values()
    .filter(|s| **s == NodeState::Failed)
    .count();
  assert_eq!(failed, 1);
  assert_eq!(provider.calls(), vec![Call::Create("database".to_string())]);
}

#[tokio::test]
async fn random_secret_is_stable_across_applies() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "secrets": [
      { "name": "db-password", "policy": "random_on_create", "length": 30, "exclude": "@/\" " }
    ],
    "resources": [
      {
        "name": "database",
        "type": "resource",
        "kind": "database",
        "inputs": {
          "user": "admin",
          "password": { "secret": "db-password" }
        }
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let secrets = Arc::new(SecretStore::new());
  let engine = ProvisioningEngine::new(Arc::new(FakeProvider::default()), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), secrets.clone());
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  let password = first.resolved_inputs["database"]["password"].clone();
  assert!(password.as_str().unwrap().len() == 30);

  // Next run: the store is re-seeded from persisted records, exactly as
  // the CLI does between processes.
  let restored = Arc::new(SecretStore::from_records(secrets.records()));
  let provider2 = Arc::new(FakeProvider::default());
  let engine2 = ProvisioningEngine::new(provider2.clone(), EngineOptions::default());
  let ctx2 = context(&def, report_to_prior(&first), restored.clone());
  let second = engine2
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(second.resolved_inputs["database"]["password"], password);
  assert_eq!(second.actions["database"], AppliedAction::Unchanged);
  assert!(provider2.calls().is_empty());
  assert_eq!(restored.version("db-password").unwrap(), 1);
}

#[tokio::test]
async fn rotation_propagates_on_the_next_apply() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "secrets": [
      { "name": "db-password", "policy": "random_on_create", "length": 30, "exclude": "@/\" " }
    ],
    "resources": [
      {
        "name": "database",
        "type": "resource",
        "kind": "database",
        "inputs": {
          "user": "admin",
          "password": { "secret": "db-password" }
        }
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let secrets = Arc::new(SecretStore::new());
  let engine = ProvisioningEngine::new(Arc::new(FakeProvider::default()), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), secrets.clone());
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  // Explicit rotation between runs; the consumer resolves the new value at
  // its own provisioning time and converges with an in-place update.
  let restored = Arc::new(SecretStore::from_records(secrets.records()));
  restored.rotate("db-password", "rotated-value").unwrap();

  let provider2 = Arc::new(FakeProvider::default());
  let engine2 = ProvisioningEngine::new(provider2.clone(), EngineOptions::default());
  let ctx2 = context(&def, report_to_prior(&first), restored.clone());
  let second = engine2
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();

  assert!(second.is_converged());
  assert_eq!(second.actions["database"], AppliedAction::Updated);
  assert_eq!(
    second.resolved_inputs["database"]["password"],
    json!("rotated-value")
  );
  assert_eq!(provider2.calls(), vec![Call::Update("database".to_string())]);
  assert_eq!(restored.version("db-password").unwrap(), 2);
}

#[tokio::test]
async fn endpoint_reference_resolves_at_provisioning_time() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "resources": [
      {
        "name": "worker",
        "type": "resource",
        "kind": "compute-task",
        "inputs": { "BROKER_URL": { "service": "broker" } }
      },
      {
        "name": "broker",
        "type": "resource",
        "kind": "broker",
        "inputs": { "port": 6379 },
        "expose": { "service": "broker", "ttl_secs": 300 }
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let engine = ProvisioningEngine::new(Arc::new(FakeProvider::default()), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));
  let report = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_converged());
  assert_eq!(
    report.resolved_inputs["worker"]["BROKER_URL"],
    json!("broker.svc.internal:6379")
  );
}

#[tokio::test]
async fn external_function_feeds_its_secret_to_consumers() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "secrets": [
      { "name": "shared-key", "policy": "externally_computed" }
    ],
    "resources": [
      {
        "name": "web",
        "type": "resource",
        "kind": "compute-task",
        "inputs": { "ENCRYPTION_KEY": { "secret": "shared-key" } }
      },
      {
        "name": "key-generator",
        "type": "external_function",
        "function": "static-key",
        "target_secret": "shared-key"
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let secrets = Arc::new(SecretStore::new());
  let mut engine =
    ProvisioningEngine::new(Arc::new(FakeProvider::default()), EngineOptions::default());
  engine.register_function("static-key", Arc::new(StaticKeyFunction));
  let ctx = context(&def, PriorState::new(), secrets.clone());
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  assert!(first.is_converged());
  assert_eq!(first.actions["key-generator"], AppliedAction::Invoked);
  assert_eq!(
    first.resolved_inputs["web"]["ENCRYPTION_KEY"],
    json!("derived-key-material")
  );
  assert_eq!(secrets.version("shared-key").unwrap(), 1);

  // Re-apply: the one-shot is not re-invoked and the version holds.
  let restored = Arc::new(SecretStore::from_records(secrets.records()));
  let ctx2 = context(&def, report_to_prior(&first), restored.clone());
  let second = engine
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(second.actions["key-generator"], AppliedAction::Unchanged);
  assert_eq!(restored.version("shared-key").unwrap(), 1);
}

#[tokio::test]
async fn unregistered_function_is_fatal_before_provisioning() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "secrets": [
      { "name": "shared-key", "policy": "externally_computed" }
    ],
    "resources": [
      { "name": "database", "type": "resource", "kind": "database" },
      {
        "name": "key-generator",
        "type": "external_function",
        "function": "missing",
        "target_secret": "shared-key"
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let provider = Arc::new(FakeProvider::default());
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));

  let err = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::UnknownFunction { .. }));
  assert!(provider.calls().is_empty(), "nothing may provision after a fatal error");
}

#[tokio::test]
async fn disruptive_change_is_refused_without_confirmation() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "resources": [
      {
        "name": "database",
        "type": "resource",
        "kind": "database",
        "inputs": { "engine": "postgres" },
        "replace_triggers": ["engine"]
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();
  let engine = ProvisioningEngine::new(Arc::new(FakeProvider::default()), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));
  let first = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  let mut changed = def.clone();
  changed.resources[0]
    .inputs
    .insert("engine".to_string(), serde_json::from_value(json!("mysql")).unwrap());
  let graph = build_graph(&changed).unwrap();

  // Refused without confirmation.
  let provider2 = Arc::new(FakeProvider::default());
  let engine2 = ProvisioningEngine::new(provider2.clone(), EngineOptions::default());
  let ctx2 = context(&changed, report_to_prior(&first), Arc::new(SecretStore::new()));
  let refused = engine2
    .apply(&graph, &ctx2, CancellationToken::new())
    .await
    .unwrap();
  match &refused.outcome {
    ApplyOutcome::Halted { node, error } => {
      assert_eq!(node, "database");
      match error {
        EngineError::DisruptiveChange { attributes, .. } => {
          assert_eq!(attributes, &vec!["engine".to_string()]);
        }
        other => panic!("expected disruptive-change error, got: {:?}", other),
      }
    }
    other => panic!("expected halt, got: {:?}", other),
  }
  assert!(provider2.calls().is_empty());

  // Confirmed: destroy then recreate.
  let provider3 = Arc::new(FakeProvider::default());
  let options = EngineOptions {
    allow_disruptive: true,
    ..EngineOptions::default()
  };
  let engine3 = ProvisioningEngine::new(provider3.clone(), options);
  let ctx3 = context(&changed, report_to_prior(&first), Arc::new(SecretStore::new()));
  let replaced = engine3
    .apply(&graph, &ctx3, CancellationToken::new())
    .await
    .unwrap();
  assert!(replaced.is_converged());
  assert_eq!(replaced.actions["database"], AppliedAction::Replaced);
  assert_eq!(
    provider3.calls(),
    vec![
      Call::Delete("database".to_string()),
      Call::Create("database".to_string())
    ]
  );
}

#[tokio::test]
async fn cancellation_stops_scheduling_and_leaves_inflight_provisioning() {
  let def = web_and_database();
  let graph = build_graph(&def).unwrap();
  let provider = Arc::new(FakeProvider::with_delay(Duration::from_secs(5)));
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let report = engine.apply(&graph, &ctx, cancel).await.unwrap();

  assert!(matches!(report.outcome, ApplyOutcome::Cancelled));
  // The first wave (database) was in flight; it is never assumed Ready.
  assert_eq!(report.state("database"), Some(NodeState::Provisioning));
  assert_eq!(report.state("web"), Some(NodeState::Pending));
}

#[tokio::test]
async fn concurrency_is_bounded_by_the_semaphore() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "resources": [
      { "name": "a", "type": "resource", "kind": "compute-task" },
      { "name": "b", "type": "resource", "kind": "compute-task" },
      { "name": "c", "type": "resource", "kind": "compute-task" },
      { "name": "d", "type": "resource", "kind": "compute-task" }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let provider = Arc::new(FakeProvider::with_delay(Duration::from_millis(50)));
  let options = EngineOptions {
    max_concurrency: 2,
    ..EngineOptions::default()
  };
  let engine = ProvisioningEngine::new(provider.clone(), options);
  let ctx = context(&def, PriorState::new(), Arc::new(SecretStore::new()));

  let report = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_converged());
  assert!(
    provider.peak_in_flight.load(Ordering::SeqCst) <= 2,
    "more than two driver calls ran at once"
  );
}

#[tokio::test]
async fn teardown_deletes_in_reverse_dependency_order() {
  let def: DeploymentDef = serde_json::from_value(json!({
    "name": "platform",
    "secrets": [
      { "name": "db-password", "policy": "random_on_create", "length": 16, "exclude": "" }
    ],
    "resources": [
      {
        "name": "web",
        "type": "resource",
        "kind": "compute-task",
        "inputs": {
          "DATABASE_HOST": { "node": "database", "output": "host" },
          "DATABASE_PASSWORD": { "secret": "db-password" }
        }
      },
      {
        "name": "database",
        "type": "resource",
        "kind": "database"
      }
    ]
  }))
  .unwrap();
  let graph = build_graph(&def).unwrap();

  let secrets = Arc::new(SecretStore::new());
  let provider = Arc::new(FakeProvider::default());
  let engine = ProvisioningEngine::new(provider.clone(), EngineOptions::default());
  let ctx = context(&def, PriorState::new(), secrets.clone());
  let report = engine
    .apply(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();
  assert!(report.is_converged());

  let ctx = context(&def, report_to_prior(&report), secrets.clone());
  let teardown = engine
    .teardown(&graph, &ctx, CancellationToken::new())
    .await
    .unwrap();

  assert!(matches!(teardown.outcome, ApplyOutcome::Converged));
  assert_eq!(
    teardown.deleted,
    vec!["web".to_string(), "database".to_string()],
    "teardown must reverse the provisioning order"
  );
  assert_eq!(teardown.deleted_secrets, vec!["db-password".to_string()]);
  assert!(secrets.records().is_empty());
  let deletes: Vec<Call> = provider
    .calls()
    .into_iter()
    .filter(|c| matches!(c, Call::Delete(_)))
    .collect();
  assert_eq!(
    deletes,
    vec![
      Call::Delete("web".to_string()),
      Call::Delete("database".to_string())
    ]
  );
}
