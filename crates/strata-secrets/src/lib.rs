//! Strata Secrets
//!
//! This crate provides the [`SecretStore`]: generated and rotated secret
//! material, keyed by namespaced name, consumed by resource nodes at the
//! moment they are provisioned.
//!
//! The store guarantees:
//! - a `RandomOnCreate` secret is generated exactly once; re-provisioning
//!   never changes the value unless an explicit rotation lands
//! - every rotation increments a version counter
//! - locking is striped per secret name, so unrelated graph branches are
//!   not serialized against each other
//!
//! Consumers hold a *reference* (the name) until provisioning time, so a
//! value read always reflects the latest rotation, not a snapshot taken
//! earlier in the run. Note the gap this leaves open: rotating a secret
//! does not restart consumers already running on the previous value;
//! convergence requires a follow-up apply.

mod error;
mod generate;

pub use error::SecretError;
pub use generate::random_string;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use strata_config::GenerationPolicy;

/// A secret as held in the store (and persisted between runs).
///
/// Values are UTF-8 strings; binary material travels base64-encoded, which
/// is also what downstream consumers expect in environment injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
  pub name: String,
  /// `None` until the first value is written (externally-computed secrets
  /// start unset).
  pub value: Option<String>,
  /// Incremented on every rotation; 0 means unset.
  pub version: u64,
}

#[derive(Debug)]
struct Entry {
  value: Option<String>,
  version: u64,
}

/// In-memory secret store for one engine run, seeded from and flushed to
/// the persisted state between runs.
#[derive(Debug, Default)]
pub struct SecretStore {
  entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl SecretStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed the store from persisted records.
  pub fn from_records<I>(records: I) -> Self
  where
    I: IntoIterator<Item = SecretRecord>,
  {
    let entries = records
      .into_iter()
      .map(|r| {
        (
          r.name,
          Arc::new(Mutex::new(Entry {
            value: r.value,
            version: r.version,
          })),
        )
      })
      .collect();
    Self {
      entries: RwLock::new(entries),
    }
  }

  /// Return the current value, creating the secret according to its policy
  /// if it does not exist yet.
  ///
  /// `RandomOnCreate` generates at version 1 on first call and returns the
  /// stored value on every later call. `ExternallyComputed` creates an
  /// unset record; `Ok(None)` means the producing function has not rotated
  /// a value in yet.
  pub fn ensure(
    &self,
    name: &str,
    policy: &GenerationPolicy,
  ) -> Result<Option<String>, SecretError> {
    let entry = self.entry_or_create(name, policy)?;
    let entry = entry.lock().expect("secret lock poisoned");
    Ok(entry.value.clone())
  }

  /// Current value; fails if the secret was never created or is still
  /// unset.
  pub fn current(&self, name: &str) -> Result<String, SecretError> {
    let entry = self.lookup(name)?;
    let entry = entry.lock().expect("secret lock poisoned");
    entry.value.clone().ok_or_else(|| SecretError::Unset {
      name: name.to_string(),
    })
  }

  /// Current version counter (0 while unset).
  pub fn version(&self, name: &str) -> Result<u64, SecretError> {
    let entry = self.lookup(name)?;
    let entry = entry.lock().expect("secret lock poisoned");
    Ok(entry.version)
  }

  /// Overwrite the value and increment the version.
  ///
  /// Fails with [`SecretError::NotFound`] if the secret was never created.
  /// Consumers already provisioned keep the previous value until they are
  /// re-applied.
  pub fn rotate(&self, name: &str, value: &str) -> Result<u64, SecretError> {
    let entry = self.lookup(name)?;
    let mut entry = entry.lock().expect("secret lock poisoned");
    entry.value = Some(value.to_string());
    entry.version += 1;
    Ok(entry.version)
  }

  /// Like [`rotate`](Self::rotate), but a value identical to the stored one
  /// leaves the version untouched.
  ///
  /// This is the write path for idempotent external functions: a duplicate
  /// invocation that returns the prior result must not look like a second
  /// rotation.
  pub fn rotate_if_changed(&self, name: &str, value: &str) -> Result<u64, SecretError> {
    let entry = self.lookup(name)?;
    let mut entry = entry.lock().expect("secret lock poisoned");
    if entry.value.as_deref() == Some(value) {
      return Ok(entry.version);
    }
    entry.value = Some(value.to_string());
    entry.version += 1;
    Ok(entry.version)
  }

  /// Drop a secret. Returns whether it existed. Only the explicit teardown
  /// pass calls this.
  pub fn remove(&self, name: &str) -> bool {
    let mut entries = self.entries.write().expect("secret map lock poisoned");
    entries.remove(name).is_some()
  }

  /// Snapshot of all records, sorted by name, for persistence.
  pub fn records(&self) -> Vec<SecretRecord> {
    let entries = self.entries.read().expect("secret map lock poisoned");
    let mut records: Vec<SecretRecord> = entries
      .iter()
      .map(|(name, entry)| {
        let entry = entry.lock().expect("secret lock poisoned");
        SecretRecord {
          name: name.clone(),
          value: entry.value.clone(),
          version: entry.version,
        }
      })
      .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
  }

  fn lookup(&self, name: &str) -> Result<Arc<Mutex<Entry>>, SecretError> {
    let entries = self.entries.read().expect("secret map lock poisoned");
    entries
      .get(name)
      .cloned()
      .ok_or_else(|| SecretError::NotFound {
        name: name.to_string(),
      })
  }

  fn entry_or_create(
    &self,
    name: &str,
    policy: &GenerationPolicy,
  ) -> Result<Arc<Mutex<Entry>>, SecretError> {
    if let Ok(existing) = self.lookup(name) {
      return Ok(existing);
    }

    let created = match policy {
      GenerationPolicy::RandomOnCreate { length, exclude } => Entry {
        value: Some(random_string(*length, exclude)?),
        version: 1,
      },
      GenerationPolicy::ExternallyComputed => Entry {
        value: None,
        version: 0,
      },
    };

    let mut entries = self.entries.write().expect("secret map lock poisoned");
    // Another branch may have created it between the read and the write.
    let entry = entries
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(created)));
    Ok(entry.clone())
  }
}
