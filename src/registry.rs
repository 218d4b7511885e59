//! Connector registry: which TPS connectors exist, whether they are enabled,
//! which key ids each may request and which transport key protects its keys.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::{TksError, TksResult};
use crate::model::KeyIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    #[default]
    Enabled,
    Disabled,
}

/// One registered connector
///
/// A grant is an exact key id, `*` for every key, or a prefix ending in `*`
/// (`tps-01-*` matches `tps-01-enc` but not `tps-02-enc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub connector_id: String,
    #[serde(default)]
    pub allowed_key_ids: BTreeSet<String>,
    pub transport_key_id: KeyIdentifier,
    #[serde(default)]
    pub status: ConnectorStatus,
}

impl Connector {
    pub fn new(connector_id: impl Into<String>, transport_key_id: impl Into<KeyIdentifier>) -> Self {
        Self {
            connector_id: connector_id.into(),
            allowed_key_ids: BTreeSet::new(),
            transport_key_id: transport_key_id.into(),
            status: ConnectorStatus::Enabled,
        }
    }

    pub fn allow(mut self, grant: impl Into<String>) -> Self {
        self.allowed_key_ids.insert(grant.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ConnectorStatus::Enabled
    }

    /// Whether any grant covers `key_id`. Matching is exact and case sensitive.
    pub fn allows(&self, key_id: &str) -> bool {
        self.allowed_key_ids.iter().any(|grant| grant_matches(grant, key_id))
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} grants)",
            self.connector_id,
            self.status,
            self.allowed_key_ids.len()
        )
    }
}

fn grant_matches(grant: &str, key_id: &str) -> bool {
    match grant.strip_suffix('*') {
        Some(prefix) => key_id.starts_with(prefix),
        None => grant == key_id,
    }
}

/// Registered connectors keyed by connector id
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_connectors(connectors: impl IntoIterator<Item = Connector>) -> TksResult<Self> {
        let registry = Self::new();
        for connector in connectors {
            registry.register(connector)?;
        }
        Ok(registry)
    }

    /// Add a connector; its id must not be registered yet
    pub fn register(&self, connector: Connector) -> TksResult<()> {
        let mut connectors = self.write()?;
        if connectors.contains_key(&connector.connector_id) {
            return Err(TksError::invalid_operation(
                "register",
                &format!("connector {} already registered", connector.connector_id),
            ));
        }
        log::info!("Registered connector {}", connector);
        connectors.insert(connector.connector_id.clone(), connector);
        Ok(())
    }

    pub fn deregister(&self, connector_id: &str) -> TksResult<Connector> {
        let removed = self
            .write()?
            .remove(connector_id)
            .ok_or_else(|| unknown(connector_id))?;
        log::info!("Deregistered connector {}", connector_id);
        Ok(removed)
    }

    pub fn enable(&self, connector_id: &str) -> TksResult<()> {
        self.modify(connector_id, |c| c.status = ConnectorStatus::Enabled)?;
        log::info!("Enabled connector {}", connector_id);
        Ok(())
    }

    pub fn disable(&self, connector_id: &str) -> TksResult<()> {
        self.modify(connector_id, |c| c.status = ConnectorStatus::Disabled)?;
        log::warn!("Disabled connector {}", connector_id);
        Ok(())
    }

    pub fn grant(&self, connector_id: &str, grant: impl Into<String>) -> TksResult<()> {
        let grant = grant.into();
        log::info!("Granting {} to connector {}", grant, connector_id);
        self.modify(connector_id, |c| {
            c.allowed_key_ids.insert(grant);
        })
    }

    /// Remove one grant. Takes effect for every check that starts afterwards.
    pub fn revoke_grant(&self, connector_id: &str, grant: &str) -> TksResult<bool> {
        let mut removed = false;
        self.modify(connector_id, |c| removed = c.allowed_key_ids.remove(grant))?;
        if removed {
            log::warn!("Revoked grant {} from connector {}", grant, connector_id);
        }
        Ok(removed)
    }

    /// Whether an enabled `connector_id` may request `key_id`
    pub fn is_authorized(&self, connector_id: &str, key_id: &str) -> bool {
        self.authorize(connector_id, key_id).is_ok()
    }

    /// Resolve and authorize a connector in one read of the registry.
    ///
    /// Returns the connector as it was at that read.
    pub fn authorize(&self, connector_id: &str, key_id: &str) -> TksResult<Connector> {
        let connectors = self.read()?;
        let connector = connectors.get(connector_id).ok_or_else(|| unknown(connector_id))?;

        if !connector.is_enabled() {
            return Err(TksError::ConnectorDisabled {
                connector_id: connector_id.to_string(),
            });
        }
        if !connector.allows(key_id) {
            return Err(TksError::NotAuthorized {
                connector_id: connector_id.to_string(),
                key_id: key_id.to_string(),
            });
        }
        Ok(connector.clone())
    }

    pub fn get(&self, connector_id: &str) -> TksResult<Connector> {
        self.read()?
            .get(connector_id)
            .cloned()
            .ok_or_else(|| unknown(connector_id))
    }

    /// All connectors, sorted by id
    pub fn list(&self) -> TksResult<Vec<Connector>> {
        let mut connectors: Vec<Connector> = self.read()?.values().cloned().collect();
        connectors.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        Ok(connectors)
    }

    fn modify<F>(&self, connector_id: &str, change: F) -> TksResult<()>
    where
        F: FnOnce(&mut Connector),
    {
        let mut connectors = self.write()?;
        let connector = connectors
            .get_mut(connector_id)
            .ok_or_else(|| unknown(connector_id))?;
        change(connector);
        Ok(())
    }

    fn read(&self) -> TksResult<RwLockReadGuard<'_, HashMap<String, Connector>>> {
        self.connectors
            .read()
            .map_err(|_| TksError::storage("registry_read", "registry lock poisoned"))
    }

    fn write(&self) -> TksResult<RwLockWriteGuard<'_, HashMap<String, Connector>>> {
        self.connectors
            .write()
            .map_err(|_| TksError::storage("registry_write", "registry lock poisoned"))
    }
}

fn unknown(connector_id: &str) -> TksError {
    TksError::UnknownConnector {
        connector_id: connector_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn registry() -> ConnectorRegistry {
        ConnectorRegistry::from_connectors([
            Connector::new("tps-01", "tps-01-transport").allow("shared-secret-1"),
            Connector::new("tps-02", "tps-02-transport").allow("tps-02-*"),
            Connector::new("ca-admin", "ca-transport").allow("*"),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_grant() {
        let registry = registry();
        assert!(registry.is_authorized("tps-01", "shared-secret-1"));
        assert!(!registry.is_authorized("tps-01", "Shared-Secret-1"));
        assert!(!registry.is_authorized("tps-02", "shared-secret-1"));
    }

    #[test]
    fn test_wildcard_grants() {
        let registry = registry();
        assert!(registry.is_authorized("tps-02", "tps-02-enc"));
        assert!(!registry.is_authorized("tps-02", "tps-03-enc"));
        assert!(registry.is_authorized("ca-admin", "anything"));
    }

    #[test]
    fn test_authorize_error_kinds() {
        let registry = registry();
        assert!(matches!(
            registry.authorize("tps-99", "shared-secret-1"),
            Err(TksError::UnknownConnector { .. })
        ));
        assert!(matches!(
            registry.authorize("tps-02", "shared-secret-1"),
            Err(TksError::NotAuthorized { .. })
        ));

        registry.disable("tps-01").unwrap();
        assert!(matches!(
            registry.authorize("tps-01", "shared-secret-1"),
            Err(TksError::ConnectorDisabled { .. })
        ));
        registry.enable("tps-01").unwrap();
        assert!(registry.authorize("tps-01", "shared-secret-1").is_ok());
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = registry();
        assert!(registry.register(Connector::new("tps-01", "t")).is_err());
        let removed = registry.deregister("tps-01").unwrap();
        assert_eq!(removed.connector_id, "tps-01");
        assert!(registry.register(Connector::new("tps-01", "t")).is_ok());
        assert!(registry.deregister("absent").is_err());
    }

    #[test]
    fn test_grant_and_revoke() {
        let registry = registry();
        registry.grant("tps-01", "extra-key").unwrap();
        assert!(registry.is_authorized("tps-01", "extra-key"));
        assert!(registry.revoke_grant("tps-01", "extra-key").unwrap());
        assert!(!registry.is_authorized("tps-01", "extra-key"));
        assert!(!registry.revoke_grant("tps-01", "extra-key").unwrap());
    }

    #[test]
    fn test_revocation_visible_after_commit() {
        let registry = Arc::new(registry());
        registry.revoke_grant("tps-01", "shared-secret-1").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.is_authorized("tps-01", "shared-secret-1"))
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
    }

    #[test]
    fn test_list_sorted() {
        let ids: Vec<_> = registry()
            .list()
            .unwrap()
            .into_iter()
            .map(|c| c.connector_id)
            .collect();
        assert_eq!(ids, vec!["ca-admin", "tps-01", "tps-02"]);
    }

    #[test]
    fn test_connector_json() {
        let json = r#"{"connector_id":"tps-01","allowed_key_ids":["a"],"transport_key_id":"t"}"#;
        let connector: Connector = serde_json::from_str(json).unwrap();
        assert!(connector.is_enabled());
        assert!(connector.allows("a"));
    }
}
