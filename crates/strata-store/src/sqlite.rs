use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{PersistedSecret, ResourceRecord, StateStore};

/// SQLite-based state store implementation.
pub struct SqliteStateStore {
  pool: SqlitePool,
}

impl SqliteStateStore {
  /// Create a new state store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) a state database at the given path.
  pub async fn connect(path: &Path) -> Result<Self, sqlx::Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

impl StateStore for SqliteStateStore {
  type Error = sqlx::Error;

  async fn upsert_resource(&self, record: &ResourceRecord) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO resource_records (name, kind, state, inputs, outputs, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              kind = excluded.kind,
              state = excluded.state,
              inputs = excluded.inputs,
              outputs = excluded.outputs,
              updated_at = excluded.updated_at
            "#,
    )
    .bind(&record.name)
    .bind(&record.kind)
    .bind(record.state)
    .bind(&record.inputs)
    .bind(&record.outputs)
    .bind(record.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_resource(&self, name: &str) -> Result<Option<ResourceRecord>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT name, kind, state, inputs, outputs, updated_at
            FROM resource_records
            WHERE name = ?
            "#,
    )
    .bind(name)
    .fetch_optional(&self.pool)
    .await
  }

  async fn list_resources(&self) -> Result<Vec<ResourceRecord>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT name, kind, state, inputs, outputs, updated_at
            FROM resource_records
            ORDER BY name ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await
  }

  async fn delete_resource(&self, name: &str) -> Result<(), Self::Error> {
    sqlx::query("DELETE FROM resource_records WHERE name = ?")
      .bind(name)
      .execute(&self.pool)
      .await?;

    Ok(())
  }

  async fn upsert_secret(&self, secret: &PersistedSecret) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO secret_records (name, value, version, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              value = excluded.value,
              version = excluded.version,
              updated_at = excluded.updated_at
            "#,
    )
    .bind(&secret.name)
    .bind(&secret.value)
    .bind(secret.version)
    .bind(secret.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_secrets(&self) -> Result<Vec<PersistedSecret>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT name, value, version, updated_at
            FROM secret_records
            ORDER BY name ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await
  }

  async fn delete_secret(&self, name: &str) -> Result<(), Self::Error> {
    sqlx::query("DELETE FROM secret_records WHERE name = ?")
      .bind(name)
      .execute(&self.pool)
      .await?;

    Ok(())
  }
}
