use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Persisted lifecycle state of a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RecordState {
  Pending,
  Provisioning,
  Ready,
  Failed,
}

/// A resource node as recorded after the last apply.
///
/// `inputs` holds the *resolved* attribute map, the values actually handed
/// to the driver, which is what the next run diffs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ResourceRecord {
  pub name: String,
  pub kind: String,
  pub state: RecordState,
  pub inputs: Json<serde_json::Value>,
  pub outputs: Json<serde_json::Value>,
  pub updated_at: DateTime<Utc>,
}

/// A secret as persisted between runs; the stability of random-on-create
/// values across redeploys lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PersistedSecret {
  pub name: String,
  pub value: Option<String>,
  pub version: i64,
  pub updated_at: DateTime<Utc>,
}
