//! Strata Config
//!
//! This crate contains the serializable deployment definition types for
//! strata. A deployment definition describes the desired set of resources,
//! the secrets they consume, and the engine settings: before any graph
//! construction or provisioning happens.
//!
//! Definitions can be loaded from:
//! - JSON files (via CLI with `strata apply deployment.json`)
//! - Database storage (as JSON blobs)
//!
//! The resolver takes these types, implies edges from attribute references,
//! and builds a validated dependency graph for the engine.

mod attr;
mod resource;
mod secret;
mod settings;

pub use attr::AttrValue;
pub use resource::{ExposeDef, ResourceDef, ResourceKind, ResourceType};
pub use secret::{GenerationPolicy, SecretDef};
pub use settings::{EngineSettings, well_known};

use serde::{Deserialize, Serialize};

/// A complete deployment definition.
///
/// `resources` is ordered; declaration order is the deterministic tie-break
/// when multiple provisioning orders are valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDef {
  pub name: String,
  #[serde(default)]
  pub secrets: Vec<SecretDef>,
  pub resources: Vec<ResourceDef>,
  #[serde(default)]
  pub settings: EngineSettings,
}
