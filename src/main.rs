mod provider;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::types::Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use strata_config::{DeploymentDef, GenerationPolicy};
use strata_engine::{
  ApplyContext, ApplyEvent, ApplyOutcome, ApplyReport, ChannelNotifier, EncodedKeyFunction,
  EngineOptions, PlannedAction, PriorRecord, PriorState, ProvisioningEngine, plan,
};
use strata_graph::{DependencyGraph, NodeState, NodeType};
use strata_registry::ServiceRegistry;
use strata_resolver::{build_graph, secret_policies};
use strata_secrets::{SecretError, SecretRecord, SecretStore, random_string};
use strata_store::{PersistedSecret, RecordState, ResourceRecord, SqliteStateStore, StateStore};

use crate::provider::SimProvider;

/// Strata - a convergent provisioning engine for multi-service workloads
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the state directory (default: ~/.strata)
  #[arg(long, global = true)]
  state_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Show what apply would do, without provisioning anything
  Plan {
    /// Path to the deployment definition (JSON)
    deployment: PathBuf,
  },

  /// Converge actual state toward the deployment definition
  Apply {
    /// Path to the deployment definition (JSON)
    deployment: PathBuf,

    /// Confirm destroy-and-recreate changes to identity attributes
    #[arg(long)]
    allow_disruptive: bool,

    /// Override the maximum number of concurrent provisioning operations
    #[arg(long)]
    concurrency: Option<usize>,
  },

  /// Rotate a random-on-create secret to a fresh value
  ///
  /// Running consumers keep the previous value until the next apply.
  Rotate {
    /// Path to the deployment definition (JSON)
    deployment: PathBuf,

    /// Name of the secret to rotate
    secret: String,
  },

  /// Destroy every provisioned resource in reverse dependency order
  Teardown {
    /// Path to the deployment definition (JSON)
    deployment: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();

  let state_dir = cli.state_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".strata")
  });

  match cli.command {
    Some(Commands::Plan { deployment }) => {
      run(run_plan(deployment, state_dir))?;
    }
    Some(Commands::Apply {
      deployment,
      allow_disruptive,
      concurrency,
    }) => {
      run(run_apply(deployment, state_dir, allow_disruptive, concurrency))?;
    }
    Some(Commands::Rotate { deployment, secret }) => {
      run(run_rotate(deployment, state_dir, secret))?;
    }
    Some(Commands::Teardown { deployment }) => {
      run(run_teardown(deployment, state_dir))?;
    }
    None => {
      println!("strata - use --help to see available commands");
    }
  }

  Ok(())
}

fn run(fut: impl std::future::Future<Output = Result<()>>) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(fut)
}

async fn run_plan(deployment_file: PathBuf, state_dir: PathBuf) -> Result<()> {
  let def = load_deployment(&deployment_file).await?;
  let graph = build_graph(&def).context("failed to resolve deployment into a graph")?;
  let store = open_store(&state_dir).await?;
  let prior = load_prior(&store).await?;

  let changes = plan(&graph, &prior)?;
  for change in &changes {
    let label = match change.action {
      PlannedAction::Create => "create",
      PlannedAction::Update => "update",
      PlannedAction::Replace => "replace!",
      PlannedAction::Noop => "no-op",
      PlannedAction::Invoke => "invoke",
      PlannedAction::Unknown => "unknown",
    };
    match &change.detail {
      Some(detail) => println!("{:>8}  {}  ({})", label, change.node, detail),
      None => println!("{:>8}  {}", label, change.node),
    }
  }
  Ok(())
}

async fn run_apply(
  deployment_file: PathBuf,
  state_dir: PathBuf,
  allow_disruptive: bool,
  concurrency: Option<usize>,
) -> Result<()> {
  let def = load_deployment(&deployment_file).await?;
  let graph = build_graph(&def).context("failed to resolve deployment into a graph")?;
  let store = open_store(&state_dir).await?;

  let prior = load_prior(&store).await?;
  let secrets = Arc::new(SecretStore::from_records(load_secrets(&store).await?));

  let mut options = EngineOptions::from_settings(&def.settings);
  options.allow_disruptive = allow_disruptive;
  if let Some(n) = concurrency {
    options.max_concurrency = n.max(1);
  }

  let (sender, mut receiver) = mpsc::unbounded_channel();
  let mut engine =
    ProvisioningEngine::with_notifier(Arc::new(SimProvider), options, ChannelNotifier::new(sender));
  engine.register_function("encoded-key", Arc::new(EncodedKeyFunction));

  let events = tokio::spawn(async move {
    while let Some(event) = receiver.recv().await {
      log_event(&event);
    }
  });

  // Ctrl-C stops scheduling new nodes; in-flight operations finish and are
  // re-resolved on the next run.
  let cancel = CancellationToken::new();
  let abort = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received; cancelling apply");
      abort.cancel();
    }
  });

  let ctx = ApplyContext {
    deployment: def.name.clone(),
    prior,
    policies: secret_policies(&def),
    secrets: secrets.clone(),
    registry: Arc::new(ServiceRegistry::new()),
  };

  let report = engine
    .apply(&graph, &ctx, cancel)
    .await
    .context("apply failed before provisioning began")?;

  // Dropping the engine closes the event channel.
  drop(engine);
  let _ = events.await;

  persist_report(&store, &graph, &ctx, &report, &secrets).await?;

  match &report.outcome {
    ApplyOutcome::Converged => {
      eprintln!("Converged: {} node(s)", graph.len());
      let outputs: serde_json::Map<String, serde_json::Value> = report
        .outputs
        .iter()
        .map(|(name, outputs)| {
          (
            name.clone(),
            serde_json::to_value(outputs).unwrap_or_default(),
          )
        })
        .collect();
      println!("{}", serde_json::to_string_pretty(&outputs)?);
      Ok(())
    }
    ApplyOutcome::Halted { node, error } => {
      let pending = report
        .states
        .values()
        .filter(|s| **s == NodeState::Pending)
        .count();
      bail!(
        "apply halted at '{}': {} ({} node(s) not attempted; state saved, re-run to converge)",
        node,
        error,
        pending
      );
    }
    ApplyOutcome::Cancelled => {
      bail!("apply cancelled; partial state saved, re-run to converge");
    }
  }
}

/// The explicit rotation request: the only way a random-on-create value
/// ever changes after creation.
async fn run_rotate(deployment_file: PathBuf, state_dir: PathBuf, secret: String) -> Result<()> {
  let def = load_deployment(&deployment_file).await?;
  let store = open_store(&state_dir).await?;

  let policy = def
    .secrets
    .iter()
    .find(|s| s.name == secret)
    .map(|s| &s.policy)
    .with_context(|| format!("secret '{}' is not declared in the deployment", secret))?;

  let GenerationPolicy::RandomOnCreate { length, exclude } = policy else {
    bail!(
      "secret '{}' is externally computed; re-invoke its producing function instead",
      secret
    );
  };

  let secrets = SecretStore::from_records(load_secrets(&store).await?);
  let value = random_string(*length, exclude)?;
  let version = match secrets.rotate(&secret, &value) {
    Ok(version) => version,
    Err(SecretError::NotFound { .. }) => {
      bail!(
        "secret '{}' has not been provisioned yet; run apply first",
        secret
      );
    }
    Err(e) => return Err(e.into()),
  };

  let now = Utc::now();
  for record in secrets.records() {
    store
      .upsert_secret(&PersistedSecret {
        name: record.name.clone(),
        value: record.value,
        version: record.version as i64,
        updated_at: now,
      })
      .await
      .with_context(|| format!("failed to persist secret '{}'", record.name))?;
  }

  eprintln!(
    "Rotated '{}' to version {}; running consumers keep the old value until the next apply",
    secret, version
  );
  Ok(())
}

async fn run_teardown(deployment_file: PathBuf, state_dir: PathBuf) -> Result<()> {
  let def = load_deployment(&deployment_file).await?;
  let graph = build_graph(&def).context("failed to resolve deployment into a graph")?;
  let store = open_store(&state_dir).await?;

  let prior = load_prior(&store).await?;
  let secrets = Arc::new(SecretStore::from_records(load_secrets(&store).await?));

  let engine = ProvisioningEngine::new(
    Arc::new(SimProvider),
    EngineOptions::from_settings(&def.settings),
  );

  let ctx = ApplyContext {
    deployment: def.name.clone(),
    prior,
    policies: secret_policies(&def),
    secrets: secrets.clone(),
    registry: Arc::new(ServiceRegistry::new()),
  };

  let report = engine
    .teardown(&graph, &ctx, CancellationToken::new())
    .await
    .context("teardown failed before any deletion")?;

  for name in &report.deleted {
    store
      .delete_resource(name)
      .await
      .with_context(|| format!("failed to drop record for '{}'", name))?;
  }
  for name in &report.deleted_secrets {
    store
      .delete_secret(name)
      .await
      .with_context(|| format!("failed to drop secret record '{}'", name))?;
  }

  match &report.outcome {
    ApplyOutcome::Converged => {
      eprintln!(
        "Teardown complete: {} node(s), {} secret(s)",
        report.deleted.len(),
        report.deleted_secrets.len()
      );
      Ok(())
    }
    ApplyOutcome::Halted { node, error } => {
      bail!("teardown halted at '{}': {}", node, error);
    }
    ApplyOutcome::Cancelled => {
      bail!("teardown cancelled; re-run to finish");
    }
  }
}

async fn load_deployment(path: &PathBuf) -> Result<DeploymentDef> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read deployment file: {}", path.display()))?;
  let def: DeploymentDef = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse deployment file: {}", path.display()))?;
  Ok(def)
}

async fn open_store(state_dir: &PathBuf) -> Result<SqliteStateStore> {
  tokio::fs::create_dir_all(state_dir)
    .await
    .with_context(|| format!("failed to create state directory: {}", state_dir.display()))?;
  let store = SqliteStateStore::connect(&state_dir.join("state.db"))
    .await
    .context("failed to open state database")?;
  store
    .migrate()
    .await
    .context("failed to migrate state database")?;
  Ok(store)
}

async fn load_prior(store: &SqliteStateStore) -> Result<PriorState> {
  let mut prior = PriorState::new();
  for record in store
    .list_resources()
    .await
    .context("failed to load prior state")?
  {
    let inputs: BTreeMap<String, serde_json::Value> =
      serde_json::from_value(record.inputs.0).unwrap_or_default();
    let outputs: BTreeMap<String, serde_json::Value> =
      serde_json::from_value(record.outputs.0).unwrap_or_default();
    prior.insert(
      record.name,
      PriorRecord {
        inputs,
        outputs,
        state: node_state(record.state),
      },
    );
  }
  Ok(prior)
}

async fn load_secrets(store: &SqliteStateStore) -> Result<Vec<SecretRecord>> {
  let records = store
    .list_secrets()
    .await
    .context("failed to load secret records")?;
  Ok(
    records
      .into_iter()
      .map(|s| SecretRecord {
        name: s.name,
        value: s.value,
        version: s.version.max(0) as u64,
      })
      .collect(),
  )
}

/// Write the run's node states, resolved inputs, outputs, and secrets back
/// to the state database, so the next run diffs instead of re-deriving.
async fn persist_report(
  store: &SqliteStateStore,
  graph: &DependencyGraph,
  ctx: &ApplyContext,
  report: &ApplyReport,
  secrets: &SecretStore,
) -> Result<()> {
  let now = Utc::now();

  for node in graph.nodes() {
    let Some(state) = report.state(&node.name) else {
      continue;
    };
    // Untouched nodes keep whatever the last run recorded.
    if state == NodeState::Pending {
      continue;
    }

    let prior = ctx.prior.get(&node.name);
    let inputs = report
      .resolved_inputs
      .get(&node.name)
      .cloned()
      .or_else(|| prior.map(|p| p.inputs.clone()))
      .unwrap_or_default();
    let outputs = report
      .outputs
      .get(&node.name)
      .cloned()
      .or_else(|| prior.map(|p| p.outputs.clone()))
      .unwrap_or_default();

    let kind = match &node.ty {
      NodeType::Resource { kind } => kind.to_string(),
      NodeType::ExternalFunction(_) => "external-function".to_string(),
    };

    store
      .upsert_resource(&ResourceRecord {
        name: node.name.clone(),
        kind,
        state: record_state(state),
        inputs: Json(serde_json::to_value(&inputs)?),
        outputs: Json(serde_json::to_value(&outputs)?),
        updated_at: now,
      })
      .await
      .with_context(|| format!("failed to persist record for '{}'", node.name))?;
  }

  for secret in secrets.records() {
    store
      .upsert_secret(&PersistedSecret {
        name: secret.name.clone(),
        value: secret.value,
        version: secret.version as i64,
        updated_at: now,
      })
      .await
      .with_context(|| format!("failed to persist secret '{}'", secret.name))?;
  }

  Ok(())
}

fn record_state(state: NodeState) -> RecordState {
  match state {
    NodeState::Pending => RecordState::Pending,
    NodeState::Provisioning => RecordState::Provisioning,
    NodeState::Ready => RecordState::Ready,
    NodeState::Failed => RecordState::Failed,
  }
}

fn node_state(state: RecordState) -> NodeState {
  match state {
    RecordState::Pending => NodeState::Pending,
    RecordState::Provisioning => NodeState::Provisioning,
    RecordState::Ready => NodeState::Ready,
    RecordState::Failed => NodeState::Failed,
  }
}

fn log_event(event: &ApplyEvent) {
  match event {
    ApplyEvent::ApplyStarted {
      apply_id,
      deployment,
    } => {
      info!(apply_id = %apply_id, deployment = %deployment, "apply started");
    }
    ApplyEvent::NodeStarted { node, .. } => {
      info!(node = %node, "provisioning");
    }
    ApplyEvent::NodeReady { node, action, .. } => {
      info!(node = %node, action = ?action, "ready");
    }
    ApplyEvent::NodeFailed { node, error, .. } => {
      error!(node = %node, error = %error, "failed");
    }
    ApplyEvent::NodeDeleted { node, .. } => {
      info!(node = %node, "deleted");
    }
    ApplyEvent::ApplyCompleted { apply_id } => {
      info!(apply_id = %apply_id, "apply completed");
    }
    ApplyEvent::ApplyHalted {
      apply_id,
      node,
      error,
    } => {
      error!(apply_id = %apply_id, node = %node, error = %error, "apply halted");
    }
    ApplyEvent::ApplyCancelled { apply_id } => {
      warn!(apply_id = %apply_id, "apply cancelled");
    }
  }
}
