//! Strata Registry
//!
//! Maps logical service names to resolved network locations. The engine
//! registers an endpoint when the owning node reaches Ready; dependent
//! nodes resolve by name at their own provisioning time.
//!
//! Resolution fails while the owning node has not reached Ready this run;
//! the resolver turns every endpoint reference into an ordering edge, so a
//! validated graph never hits that failure. Entries carry a TTL; a lapsed
//! entry is treated as absent until the owner re-registers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
  /// The owning node has not reached Ready (or the entry's TTL lapsed).
  #[error("service not registered: '{name}'")]
  NotRegistered { name: String },
}

/// A resolved network location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub host: String,
  pub port: u16,
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

#[derive(Debug)]
struct Entry {
  endpoint: Endpoint,
  registered_at: Instant,
  ttl: Duration,
}

impl Entry {
  fn is_fresh(&self) -> bool {
    self.registered_at.elapsed() <= self.ttl
  }
}

/// Shared service-name table, lock striped per name so unrelated branches
/// do not serialize against each other.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
  entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl ServiceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Publish an endpoint under a logical name. Re-registration replaces the
  /// entry and restarts its TTL.
  pub fn register(&self, name: &str, endpoint: Endpoint, ttl: Duration) {
    let entry = Entry {
      endpoint,
      registered_at: Instant::now(),
      ttl,
    };
    let mut entries = self.entries.write().expect("registry lock poisoned");
    match entries.get(name) {
      Some(existing) => {
        *existing.lock().expect("registry entry lock poisoned") = entry;
      }
      None => {
        entries.insert(name.to_string(), Arc::new(Mutex::new(entry)));
      }
    }
  }

  /// Resolve a logical name to its current endpoint.
  pub fn resolve(&self, name: &str) -> Result<Endpoint, RegistryError> {
    let entry = {
      let entries = self.entries.read().expect("registry lock poisoned");
      entries.get(name).cloned()
    };
    let entry = entry.ok_or_else(|| RegistryError::NotRegistered {
      name: name.to_string(),
    })?;
    let entry = entry.lock().expect("registry entry lock poisoned");
    if !entry.is_fresh() {
      return Err(RegistryError::NotRegistered {
        name: name.to_string(),
      });
    }
    Ok(entry.endpoint.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint {
      host: host.to_string(),
      port,
    }
  }

  #[test]
  fn resolve_returns_registered_endpoint() {
    let registry = ServiceRegistry::new();
    registry.register(
      "broker",
      endpoint("broker.svc.internal", 6379),
      Duration::from_secs(60),
    );
    let resolved = registry.resolve("broker").unwrap();
    assert_eq!(resolved.to_string(), "broker.svc.internal:6379");
  }

  #[test]
  fn unregistered_name_fails() {
    let registry = ServiceRegistry::new();
    assert_eq!(
      registry.resolve("web"),
      Err(RegistryError::NotRegistered {
        name: "web".to_string()
      })
    );
  }

  #[test]
  fn lapsed_ttl_reads_as_absent() {
    let registry = ServiceRegistry::new();
    registry.register("web", endpoint("web.svc.internal", 8080), Duration::ZERO);
    std::thread::sleep(Duration::from_millis(5));
    assert!(registry.resolve("web").is_err());

    // Re-registration by the owner makes it resolvable again.
    registry.register(
      "web",
      endpoint("web.svc.internal", 8080),
      Duration::from_secs(60),
    );
    assert!(registry.resolve("web").is_ok());
  }
}
