//! In-process simulation control plane.
//!
//! Fabricates deterministic per-kind outputs so the full engine path
//! (graph execution, diffing, secret resolution, service registration) can
//! run locally without a real provider. Real drivers implement the same
//! [`ResourceProvider`] trait against managed services.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use strata_config::ResourceKind;
use strata_engine::{Outputs, ProviderError, ResolvedInputs, ResourceProvider};

pub struct SimProvider;

impl SimProvider {
  fn fabricate(name: &str, kind: ResourceKind, inputs: &ResolvedInputs) -> Outputs {
    let port_or = |fallback: u64| {
      inputs
        .get("port")
        .and_then(|v| v.as_u64())
        .unwrap_or(fallback)
    };

    let mut outputs = Outputs::new();
    match kind {
      ResourceKind::Cluster => {
        outputs.insert("cluster_id".to_string(), json!(format!("sim-{name}")));
      }
      ResourceKind::Database => {
        outputs.insert("host".to_string(), json!(format!("{name}.db.internal")));
        outputs.insert("port".to_string(), json!(port_or(5432)));
        outputs.insert("identifier".to_string(), json!(name));
      }
      ResourceKind::Broker => {
        outputs.insert("host".to_string(), json!(format!("{name}.cache.internal")));
        outputs.insert("port".to_string(), json!(port_or(6379)));
      }
      ResourceKind::ComputeTask => {
        outputs.insert("host".to_string(), json!(format!("{name}.svc.internal")));
        outputs.insert("port".to_string(), json!(port_or(8080)));
        outputs.insert("unit".to_string(), json!(format!("sim-task-{name}")));
      }
      ResourceKind::LoadBalancer => {
        outputs.insert("host".to_string(), json!(format!("{name}.lb.internal")));
        outputs.insert("port".to_string(), json!(port_or(80)));
      }
      ResourceKind::DnsNamespace => {
        outputs.insert("zone".to_string(), json!(format!("{name}.internal")));
      }
    }
    outputs
  }
}

#[async_trait]
impl ResourceProvider for SimProvider {
  async fn create(
    &self,
    name: &str,
    kind: ResourceKind,
    inputs: &ResolvedInputs,
  ) -> Result<Outputs, ProviderError> {
    debug!(node = %name, kind = %kind, "sim_create");
    Ok(Self::fabricate(name, kind, inputs))
  }

  async fn update(
    &self,
    name: &str,
    kind: ResourceKind,
    inputs: &ResolvedInputs,
    _prior_outputs: &Outputs,
  ) -> Result<Outputs, ProviderError> {
    debug!(node = %name, kind = %kind, "sim_update");
    Ok(Self::fabricate(name, kind, inputs))
  }

  async fn delete(
    &self,
    name: &str,
    kind: ResourceKind,
    _outputs: &Outputs,
  ) -> Result<(), ProviderError> {
    debug!(node = %name, kind = %kind, "sim_delete");
    Ok(())
  }
}
