//! Config-derived service registry
//!
//! Services can be declared directly in configuration as service entries.
//! This adapter projects the `service-entries` collection of the config store
//! into the registry model and translates config events into service events.
//! It is always present in the aggregate, regardless of which registries the
//! operator selected.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{
    Event, InstanceHandler, Port, RegistryController, Service, ServiceDiscovery, ServiceHandler,
    ServiceInstance,
};
use crate::config::{collections, ConfigEntry, ConfigEvent, ConfigStoreCache};
use crate::lifecycle::ShutdownSignal;
use crate::registry::provider;
use crate::Result;

/// Body of a service entry.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServiceEntrySpec {
    hosts: Vec<String>,
    ports: Vec<EntryPort>,
    endpoints: Vec<EntryEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EntryPort {
    name: String,
    number: u16,
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EntryEndpoint {
    address: String,
    ports: BTreeMap<String, u16>,
    labels: BTreeMap<String, String>,
    network: Option<String>,
}

/// Registry adapter over the config store's service entries.
pub struct ServiceEntryStore {
    store: Arc<dyn ConfigStoreCache>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
}

impl ServiceEntryStore {
    /// Create the adapter and subscribe it to config changes.
    pub fn new(store: Arc<dyn ConfigStoreCache>) -> Arc<Self> {
        let entry_store = Arc::new(Self {
            store: store.clone(),
            service_handlers: RwLock::new(Vec::new()),
            instance_handlers: RwLock::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&entry_store);
        store.register_event_handler(Arc::new(move |entry, event| {
            if entry.kind != collections::SERVICE_ENTRIES {
                return;
            }
            if let Some(this) = weak.upgrade() {
                this.handle_config_event(entry, event);
            }
        }));

        entry_store
    }

    fn handle_config_event(&self, entry: &ConfigEntry, event: ConfigEvent) {
        let event = match event {
            ConfigEvent::Add => Event::Add,
            ConfigEvent::Update => Event::Update,
            ConfigEvent::Delete => Event::Delete,
        };
        let handlers = self.service_handlers.read().expect("handler lock poisoned");
        for service in convert_entry(entry) {
            for handler in handlers.iter() {
                handler(&service, event);
            }
        }
    }

    fn entries(&self) -> Vec<ConfigEntry> {
        self.store.list(collections::SERVICE_ENTRIES, None)
    }
}

fn parse_spec(entry: &ConfigEntry) -> Option<ServiceEntrySpec> {
    match serde_json::from_value(entry.spec.clone()) {
        Ok(spec) => Some(spec),
        Err(e) => {
            warn!(name = %entry.name, namespace = %entry.namespace, error = %e,
                "malformed service entry");
            None
        }
    }
}

/// Project one config entry onto the service model, one service per host.
fn convert_entry(entry: &ConfigEntry) -> Vec<Service> {
    let Some(spec) = parse_spec(entry) else {
        return Vec::new();
    };
    let ports: Vec<Port> = spec
        .ports
        .iter()
        .map(|p| Port {
            name: p.name.clone(),
            port: p.number,
            protocol: p.protocol.clone(),
        })
        .collect();

    spec.hosts
        .iter()
        .map(|host| Service {
            hostname: host.clone(),
            address: None,
            ports: ports.clone(),
            cluster_id: provider::SERVICE_ENTRIES.to_string(),
        })
        .collect()
}

impl ServiceDiscovery for ServiceEntryStore {
    fn services(&self) -> Result<Vec<Service>> {
        Ok(self
            .entries()
            .iter()
            .flat_map(|entry| convert_entry(entry))
            .collect())
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.entries()
            .iter()
            .flat_map(|entry| convert_entry(entry))
            .find(|svc| svc.hostname == hostname)
    }

    fn instances(&self, hostname: &str) -> Vec<ServiceInstance> {
        let mut out = Vec::new();
        for entry in self.entries() {
            let Some(spec) = parse_spec(&entry) else {
                continue;
            };
            if !spec.hosts.iter().any(|h| h == hostname) {
                continue;
            }
            for endpoint in &spec.endpoints {
                for port in &spec.ports {
                    let port_number = endpoint.ports.get(&port.name).copied().unwrap_or(port.number);
                    out.push(ServiceInstance {
                        hostname: hostname.to_string(),
                        address: endpoint.address.clone(),
                        port: port_number,
                        labels: endpoint.labels.clone(),
                        network: endpoint.network.clone(),
                    });
                }
            }
        }
        out
    }
}

#[async_trait]
impl RegistryController for ServiceEntryStore {
    fn append_service_handler(&self, handler: ServiceHandler) {
        self.service_handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    fn append_instance_handler(&self, handler: InstanceHandler) {
        self.instance_handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.store.has_synced()
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        // The config store drives all updates.
        stop.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryController;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(name: &str, host: &str) -> ConfigEntry {
        ConfigEntry {
            kind: collections::SERVICE_ENTRIES.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            spec: serde_json::json!({
                "hosts": [host],
                "ports": [{"name": "https", "number": 443, "protocol": "tls"}],
                "endpoints": [
                    {"address": "10.1.1.1", "labels": {"version": "v1"}},
                    {"address": "10.1.1.2", "ports": {"https": 8443}, "network": "nw1"}
                ]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn projects_entries_to_services_and_instances() {
        let config = Arc::new(MemoryController::new());
        let store = ServiceEntryStore::new(config.clone());

        config.apply(entry("db", "db.external.com"), ConfigEvent::Add);

        let services = store.services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].hostname, "db.external.com");
        assert_eq!(services[0].ports[0].port, 443);

        let instances = store.instances("db.external.com");
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].port, 443);
        assert_eq!(instances[1].port, 8443);
        assert_eq!(instances[1].network.as_deref(), Some("nw1"));

        assert!(store.get_service("db.external.com").is_some());
        assert!(store.get_service("missing.external.com").is_none());
    }

    #[test]
    fn config_events_become_service_events() {
        let config = Arc::new(MemoryController::new());
        let store = ServiceEntryStore::new(config.clone());

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        store.append_service_handler(Arc::new(move |svc, event| {
            assert_eq!(svc.hostname, "db.external.com");
            assert!(matches!(event, Event::Add | Event::Delete));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let e = entry("db", "db.external.com");
        config.apply(e.clone(), ConfigEvent::Add);
        config.apply(e, ConfigEvent::Delete);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_spec_is_skipped() {
        let config = Arc::new(MemoryController::new());
        let store = ServiceEntryStore::new(config.clone());

        config.apply(
            ConfigEntry {
                kind: collections::SERVICE_ENTRIES.to_string(),
                name: "broken".to_string(),
                namespace: "default".to_string(),
                spec: serde_json::json!({"hosts": "not-a-list"}),
                ..Default::default()
            },
            ConfigEvent::Add,
        );

        assert!(store.services().unwrap().is_empty());
    }

    #[test]
    fn sync_follows_backing_store() {
        let config = Arc::new(MemoryController::new());
        let store = ServiceEntryStore::new(config.clone());
        assert!(!store.has_synced());
        config.mark_synced();
        assert!(store.has_synced());
    }
}
