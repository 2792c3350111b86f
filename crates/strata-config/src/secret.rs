use serde::{Deserialize, Serialize};

/// Declares a named secret and how its value comes into existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretDef {
  pub name: String,
  #[serde(flatten)]
  pub policy: GenerationPolicy,
}

/// How a secret's initial value is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum GenerationPolicy {
  /// Generated from OS randomness on first use and stable thereafter.
  ///
  /// `exclude` lists characters that must never appear in the value. The
  /// exclusion set is configuration, not a constant, because different
  /// downstream parsers choke on different characters (a database DSN
  /// cannot carry `@` or `/`, a shell export cannot carry `"`).
  RandomOnCreate {
    length: usize,
    #[serde(default)]
    exclude: String,
  },

  /// Written by an external function invocation; the store only holds an
  /// unset placeholder until the first rotation lands.
  ExternallyComputed,
}
