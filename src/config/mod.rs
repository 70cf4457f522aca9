//! Configuration store model
//!
//! Configuration objects flow into the control plane from several kinds of
//! sources: local directories, streaming remote endpoints, the cluster API,
//! or a caller-supplied controller. Every source is normalized behind the
//! same two traits, [`ConfigStore`] for reads and [`ConfigStoreCache`] for
//! lifecycle and change notification, so the rest of the control plane never
//! knows which kind it is talking to.

pub mod aggregate;
pub mod ingress;
pub mod kube;
pub mod memory;
pub mod monitor;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::ShutdownSignal;

/// Known configuration collections.
pub mod collections {
    /// Traffic routing rules.
    pub const ROUTES: &str = "routes";
    /// Mesh edge gateways.
    pub const GATEWAYS: &str = "gateways";
    /// Services declared in configuration rather than discovered.
    pub const SERVICE_ENTRIES: &str = "service-entries";
    /// Security policies.
    pub const POLICIES: &str = "policies";

    /// All collections, in canonical order.
    pub fn all() -> &'static [&'static str] {
        &[ROUTES, GATEWAYS, SERVICE_ENTRIES, POLICIES]
    }

    /// Whether `kind` names a known collection.
    pub fn is_known(kind: &str) -> bool {
        all().contains(&kind)
    }
}

/// A single configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigEntry {
    /// Collection the object belongs to.
    pub kind: String,
    /// Object name, unique within kind + namespace.
    pub name: String,
    /// Namespace; empty means cluster-scoped.
    pub namespace: String,
    /// Store-assigned revision. Volatile: excluded from structural equality.
    pub resource_version: String,
    /// Creation timestamp. Volatile: excluded from structural equality.
    pub created_at: Option<DateTime<Utc>>,
    /// Opaque object body.
    pub spec: serde_json::Value,
}

impl Default for ConfigEntry {
    fn default() -> Self {
        Self {
            kind: String::new(),
            name: String::new(),
            namespace: String::new(),
            resource_version: String::new(),
            created_at: None,
            spec: serde_json::Value::Null,
        }
    }
}

impl ConfigEntry {
    /// Store key within a collection.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Structural equality: compares semantic content only, ignoring the
    /// store-assigned revision and timestamps.
    pub fn structural_eq(&self, other: &ConfigEntry) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.namespace == other.namespace
            && self.spec == other.spec
    }
}

/// Change event on a configuration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// Object created.
    Add,
    /// Object body changed.
    Update,
    /// Object removed.
    Delete,
}

/// Callback invoked for every configuration change. Must return promptly.
pub type EventHandler = Arc<dyn Fn(&ConfigEntry, ConfigEvent) + Send + Sync>;

/// Read access to a configuration store.
pub trait ConfigStore: Send + Sync {
    /// Fetch one object.
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry>;

    /// List objects of a kind, optionally restricted to a namespace.
    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry>;
}

/// A configuration store with a lifecycle: it fills itself from a backing
/// source, reports when the initial snapshot has been observed, and notifies
/// handlers of changes.
#[async_trait]
pub trait ConfigStoreCache: ConfigStore {
    /// Register a change handler. Handlers registered before [`run`] see
    /// every event.
    ///
    /// [`run`]: ConfigStoreCache::run
    fn register_event_handler(&self, handler: EventHandler);

    /// Whether the initial snapshot from every backing source has been
    /// observed.
    fn has_synced(&self) -> bool;

    /// Drive the store until shutdown.
    async fn run(&self, stop: ShutdownSignal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_namespace_scoped() {
        let entry = ConfigEntry {
            kind: collections::ROUTES.to_string(),
            name: "web".to_string(),
            namespace: "prod".to_string(),
            ..Default::default()
        };
        assert_eq!(entry.key(), "prod/web");
    }

    #[test]
    fn structural_eq_ignores_volatile_metadata() {
        let a = ConfigEntry {
            kind: collections::ROUTES.to_string(),
            name: "web".to_string(),
            namespace: "prod".to_string(),
            resource_version: "1".to_string(),
            created_at: Some(Utc::now()),
            spec: serde_json::json!({"hosts": ["web.example.com"]}),
        };
        let mut b = a.clone();
        b.resource_version = "42".to_string();
        b.created_at = None;
        assert!(a.structural_eq(&b));

        b.spec = serde_json::json!({"hosts": ["other.example.com"]});
        assert!(!a.structural_eq(&b));
    }

    #[test]
    fn known_collections() {
        assert!(collections::is_known(collections::SERVICE_ENTRIES));
        assert!(!collections::is_known("virtual-machines"));
    }
}
