use serde::{Deserialize, Serialize};

/// Engine-level knobs carried alongside the deployment definition.
///
/// Constructed once and passed by reference into graph construction and the
/// engine; there is no ambient global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
  /// Maximum number of provisioning operations in flight at once.
  #[serde(default = "default_max_concurrency")]
  pub max_concurrency: usize,
  /// Default timeout for external function invocations, overridable per
  /// node.
  #[serde(default = "default_external_timeout_ms")]
  pub external_timeout_ms: u64,
  /// Default invocation attempts for external functions that support
  /// result reconciliation.
  #[serde(default = "default_external_attempts")]
  pub external_attempts: u32,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      max_concurrency: default_max_concurrency(),
      external_timeout_ms: default_external_timeout_ms(),
      external_attempts: default_external_attempts(),
    }
  }
}

fn default_max_concurrency() -> usize {
  4
}

fn default_external_timeout_ms() -> u64 {
  30_000
}

fn default_external_attempts() -> u32 {
  2
}

/// Environment-style keys conventionally injected into compute-task nodes.
///
/// These are not enforced; they name the handshake between the deployment
/// definition and the workload images so definitions stay greppable.
pub mod well_known {
  pub const DATABASE_HOST: &str = "DATABASE_HOST";
  pub const DATABASE_PORT: &str = "DATABASE_PORT";
  pub const DATABASE_USER: &str = "DATABASE_USER";
  pub const DATABASE_PASSWORD: &str = "DATABASE_PASSWORD";
  pub const BROKER_HOST: &str = "BROKER_HOST";
  pub const BROKER_PORT: &str = "BROKER_PORT";
  pub const BROKER_URL: &str = "BROKER_URL";
  pub const LOG_DESTINATION: &str = "LOG_DESTINATION";
  pub const ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";
}
