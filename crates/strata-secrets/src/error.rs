use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SecretError {
  /// The secret was never created.
  #[error("secret not found: '{name}'")]
  NotFound { name: String },

  /// The secret exists but no value has been written yet (an
  /// externally-computed secret before its first rotation).
  #[error("secret '{name}' has no value yet; its producing function has not run")]
  Unset { name: String },

  /// The generation policy cannot produce a value.
  #[error("invalid generation policy: {reason}")]
  InvalidPolicy { reason: String },
}
