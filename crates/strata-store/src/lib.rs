//! Strata Store
//!
//! This crate persists the last-applied graph between runs: node
//! identities, resolved inputs, observed outputs, and states, plus the
//! secret records whose stability across redeploys consumers depend on.
//!
//! The [`StateStore`] trait defines operations for:
//! - Upserting and querying resource records
//! - Upserting and querying secret records
//! - Removing records during teardown

mod sqlite;
mod types;

pub use sqlite::SqliteStateStore;
pub use types::{PersistedSecret, RecordState, ResourceRecord};

/// Storage trait for last-applied deployment state.
pub trait StateStore {
  /// Error type for storage operations.
  type Error;

  /// Insert or replace a resource record.
  fn upsert_resource(
    &self,
    record: &ResourceRecord,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// Get a resource record by name.
  fn get_resource(
    &self,
    name: &str,
  ) -> impl std::future::Future<Output = Result<Option<ResourceRecord>, Self::Error>> + Send;

  /// List all resource records, ordered by name.
  fn list_resources(
    &self,
  ) -> impl std::future::Future<Output = Result<Vec<ResourceRecord>, Self::Error>> + Send;

  /// Remove a resource record.
  fn delete_resource(
    &self,
    name: &str,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// Insert or replace a secret record.
  fn upsert_secret(
    &self,
    secret: &PersistedSecret,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// List all secret records, ordered by name.
  fn list_secrets(
    &self,
  ) -> impl std::future::Future<Output = Result<Vec<PersistedSecret>, Self::Error>> + Send;

  /// Remove a secret record.
  fn delete_secret(
    &self,
    name: &str,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;
}
