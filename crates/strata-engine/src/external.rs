//! The external-function protocol: imperative one-shot side effects
//! participating in an otherwise declarative plan.
//!
//! This is the only point where a side effect is delegated outside the
//! graph's own provisioning operations, and the one most prone to
//! inconsistency: a timeout does not prove the function did not succeed.
//! The runner therefore treats invocations as not safely repeatable: it
//! attaches an idempotency token, and re-invokes only after checking
//! result state through query-by-token when the function supports it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::warn;

use strata_config::GenerationPolicy;
use strata_secrets::{SecretError, SecretStore};

/// Definite failure reported by an external function.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExternalError {
  pub message: String,
}

impl ExternalError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// An externally-executed one-shot function.
///
/// Implementations receive the idempotency token with every call and are
/// responsible for detecting a duplicate token and returning the prior
/// result instead of recomputing. Functions that can report on a past
/// invocation should implement `query` and advertise it via
/// `supports_query`.
#[async_trait]
pub trait ExternalFunction: Send + Sync {
  /// Run the function; the returned string becomes the target secret's
  /// next value.
  async fn invoke(
    &self,
    payload: &serde_json::Value,
    token: &str,
  ) -> Result<String, ExternalError>;

  /// Whether `query` can report on past invocations by token.
  fn supports_query(&self) -> bool {
    false
  }

  /// Look up the result of a past invocation by its token. `Ok(None)`
  /// means no completed invocation with that token is recorded.
  async fn query(&self, _token: &str) -> Result<Option<String>, ExternalError> {
    Ok(None)
  }
}

/// One attempt series against an external function.
///
/// The token is minted once per invocation; retries reuse it so the far
/// side can deduplicate.
#[derive(Debug, Clone)]
pub struct Invocation {
  pub payload: serde_json::Value,
  pub idempotency_token: String,
  pub timeout: Duration,
  pub max_attempts: u32,
}

impl Invocation {
  pub fn new(payload: serde_json::Value, timeout: Duration, max_attempts: u32) -> Self {
    Self {
      payload,
      idempotency_token: uuid::Uuid::new_v4().to_string(),
      timeout,
      max_attempts: max_attempts.max(1),
    }
  }
}

/// How an invocation ended.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
  /// The function reported failure; safe to surface directly.
  #[error(transparent)]
  Failed(ExternalError),

  /// No response within the timeout and no way to prove the outcome.
  #[error("timed out after {attempts} attempt(s); result state unknown")]
  TimedOut { attempts: u32 },

  /// Writing the result into the secret store failed.
  #[error(transparent)]
  Secret(#[from] SecretError),
}

/// Executes an external function as a graph node and feeds the result back
/// into the secret store.
pub struct CustomResourceRunner {
  function: Arc<dyn ExternalFunction>,
}

impl CustomResourceRunner {
  pub fn new(function: Arc<dyn ExternalFunction>) -> Self {
    Self { function }
  }

  /// Drive the invocation to a definite outcome.
  ///
  /// On timeout the result is ambiguous: if the function supports
  /// query-by-token, a recorded result is adopted as success and an absent
  /// record permits one more invocation with the same token. Without query
  /// support the runner never re-invokes blindly.
  pub async fn invoke(&self, invocation: &Invocation) -> Result<String, InvocationError> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      let call = self
        .function
        .invoke(&invocation.payload, &invocation.idempotency_token);
      match tokio::time::timeout(invocation.timeout, call).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => return Err(InvocationError::Failed(e)),
        Err(_elapsed) => {
          if !self.function.supports_query() {
            return Err(InvocationError::TimedOut { attempts: attempt });
          }
          warn!(
            token = %invocation.idempotency_token,
            attempt,
            "external function timed out; reconciling by token"
          );
          match self.function.query(&invocation.idempotency_token).await {
            // The call did land; adopt its result.
            Ok(Some(value)) => return Ok(value),
            Ok(None) if attempt < invocation.max_attempts => continue,
            Ok(None) => return Err(InvocationError::TimedOut { attempts: attempt }),
            Err(e) => return Err(InvocationError::Failed(e)),
          }
        }
      }
    }
  }

  /// Invoke and store: the result is written to `target` through the
  /// rotation path. A duplicate invocation that returns the prior value
  /// leaves the version counter untouched.
  pub async fn run(
    &self,
    invocation: &Invocation,
    secrets: &SecretStore,
    target: &str,
  ) -> Result<u64, InvocationError> {
    let value = self.invoke(invocation).await?;
    secrets.ensure(target, &GenerationPolicy::ExternallyComputed)?;
    let version = secrets.rotate_if_changed(target, &value)?;
    Ok(version)
  }
}

/// Bundled function producing a 32-byte URL-safe base64 key.
///
/// This is the derived-key shape the constrained character generator
/// cannot express: consumers require exactly 32 random bytes under base64,
/// not 43 random base64 characters.
#[derive(Debug, Clone, Default)]
pub struct EncodedKeyFunction;

#[async_trait]
impl ExternalFunction for EncodedKeyFunction {
  async fn invoke(
    &self,
    _payload: &serde_json::Value,
    _token: &str,
  ) -> Result<String, ExternalError> {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    Ok(URL_SAFE.encode(key))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::sync::Mutex;

  use serde_json::json;

  use super::*;

  /// Compliant fake: remembers results by token and returns the prior one
  /// on a duplicate invocation.
  #[derive(Default)]
  struct TokenMemoFunction {
    seen: Mutex<HashMap<String, String>>,
    invocations: Mutex<u32>,
  }

  #[async_trait]
  impl ExternalFunction for TokenMemoFunction {
    async fn invoke(
      &self,
      _payload: &serde_json::Value,
      token: &str,
    ) -> Result<String, ExternalError> {
      *self.invocations.lock().unwrap() += 1;
      let mut seen = self.seen.lock().unwrap();
      let value = seen
        .entry(token.to_string())
        .or_insert_with(|| format!("derived-{}", token))
        .clone();
      Ok(value)
    }
  }

  #[tokio::test]
  async fn duplicate_token_rotates_the_version_exactly_once() {
    let function = Arc::new(TokenMemoFunction::default());
    let runner = CustomResourceRunner::new(function.clone());
    let secrets = SecretStore::new();
    let invocation = Invocation::new(json!({}), Duration::from_secs(5), 1);

    let v1 = runner.run(&invocation, &secrets, "shared-key").await.unwrap();
    let v2 = runner.run(&invocation, &secrets, "shared-key").await.unwrap();

    assert_eq!(*function.invocations.lock().unwrap(), 2);
    assert_eq!(v1, 1);
    assert_eq!(v2, 1, "same token must not double-rotate");
    assert_eq!(
      secrets.current("shared-key").unwrap(),
      format!("derived-{}", invocation.idempotency_token)
    );
  }

  /// Hangs on invoke, but exposes the completed result through query.
  struct SlowButRecorded {
    recorded: Mutex<Option<String>>,
  }

  #[async_trait]
  impl ExternalFunction for SlowButRecorded {
    async fn invoke(
      &self,
      _payload: &serde_json::Value,
      token: &str,
    ) -> Result<String, ExternalError> {
      // The side effect lands, then the response never arrives.
      *self.recorded.lock().unwrap() = Some(format!("landed-{}", token));
      std::future::pending::<()>().await;
      unreachable!()
    }

    fn supports_query(&self) -> bool {
      true
    }

    async fn query(&self, _token: &str) -> Result<Option<String>, ExternalError> {
      Ok(self.recorded.lock().unwrap().clone())
    }
  }

  #[tokio::test]
  async fn timeout_reconciles_through_query_by_token() {
    let runner = CustomResourceRunner::new(Arc::new(SlowButRecorded {
      recorded: Mutex::new(None),
    }));
    let secrets = SecretStore::new();
    let invocation = Invocation::new(json!({}), Duration::from_millis(20), 1);

    let version = runner.run(&invocation, &secrets, "shared-key").await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(
      secrets.current("shared-key").unwrap(),
      format!("landed-{}", invocation.idempotency_token)
    );
  }

  /// Hangs and has no way to report on past invocations.
  struct Unqueryable;

  #[async_trait]
  impl ExternalFunction for Unqueryable {
    async fn invoke(
      &self,
      _payload: &serde_json::Value,
      _token: &str,
    ) -> Result<String, ExternalError> {
      std::future::pending::<()>().await;
      unreachable!()
    }
  }

  #[tokio::test]
  async fn timeout_without_query_support_is_ambiguous_not_failed() {
    let runner = CustomResourceRunner::new(Arc::new(Unqueryable));
    let invocation = Invocation::new(json!({}), Duration::from_millis(20), 3);

    // max_attempts is irrelevant without query support: never re-invoke
    // blindly.
    match runner.invoke(&invocation).await {
      Err(InvocationError::TimedOut { attempts }) => assert_eq!(attempts, 1),
      other => panic!("expected timeout, got: {:?}", other),
    }
  }

  #[tokio::test]
  async fn encoded_key_is_32_bytes_under_base64() {
    let function = EncodedKeyFunction;
    let key = function.invoke(&json!({}), "token").await.unwrap();
    let decoded = URL_SAFE.decode(key.as_bytes()).unwrap();
    assert_eq!(decoded.len(), 32);
  }
}
