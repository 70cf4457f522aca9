//! Service registry model
//!
//! Services can be discovered from a cluster API, a Consul catalog, declared
//! directly in configuration, or injected by tests. Every backend is an
//! adapter with two faces: [`ServiceDiscovery`] answers queries,
//! [`RegistryController`] streams change events. The aggregate composes any
//! number of adapters behind the same two faces.

pub mod aggregate;
pub mod consul;
pub mod kube;
pub mod memory;
pub mod service_entries;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::lifecycle::ShutdownSignal;
use crate::Result;

/// Well-known registry adapter names.
pub mod provider {
    /// Cluster-API-backed registry.
    pub const KUBERNETES: &str = "Kubernetes";
    /// Consul catalog registry.
    pub const CONSUL: &str = "Consul";
    /// In-memory registry for tests.
    pub const MOCK: &str = "Mock";
    /// Services arrive through the config stream; no standalone adapter.
    pub const MCP: &str = "MCP";
    /// Config-store-derived registry, always present.
    pub const SERVICE_ENTRIES: &str = "ServiceEntries";
}

/// A network port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Port name, unique within the service.
    pub name: String,
    /// Port number.
    pub port: u16,
    /// Application protocol, e.g. `http`, `grpc`, `tcp`.
    #[serde(default)]
    pub protocol: String,
}

/// A service visible to the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Fully qualified hostname; the primary key across registries.
    pub hostname: String,
    /// Virtual address, when the registry assigns one.
    #[serde(default)]
    pub address: Option<String>,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<Port>,
    /// Registry (cluster) the service came from.
    #[serde(default)]
    pub cluster_id: String,
}

/// One endpoint backing a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Hostname of the owning service.
    pub hostname: String,
    /// Endpoint address.
    pub address: String,
    /// Endpoint port.
    pub port: u16,
    /// Endpoint labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Network the endpoint lives on, when topology is configured.
    #[serde(default)]
    pub network: Option<String>,
}

/// Change event on a service or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Object appeared.
    Add,
    /// Object changed.
    Update,
    /// Object disappeared.
    Delete,
}

/// Callback for service-level changes. Must return promptly.
pub type ServiceHandler = Arc<dyn Fn(&Service, Event) + Send + Sync>;

/// Callback for instance-level changes. Must return promptly.
pub type InstanceHandler = Arc<dyn Fn(&ServiceInstance, Event) + Send + Sync>;

/// Query face of a registry.
pub trait ServiceDiscovery: Send + Sync {
    /// All known services.
    fn services(&self) -> Result<Vec<Service>>;

    /// One service by hostname.
    fn get_service(&self, hostname: &str) -> Option<Service>;

    /// Endpoints backing a hostname.
    fn instances(&self, hostname: &str) -> Vec<ServiceInstance>;
}

/// Event face of a registry.
#[async_trait]
pub trait RegistryController: Send + Sync {
    /// Register a service change handler.
    fn append_service_handler(&self, handler: ServiceHandler);

    /// Register an instance change handler.
    fn append_instance_handler(&self, handler: InstanceHandler);

    /// Whether the initial snapshot has been observed.
    fn has_synced(&self) -> bool;

    /// Drive the registry until shutdown.
    async fn run(&self, stop: ShutdownSignal);
}

/// A named registry adapter: both faces plus identity.
#[derive(Clone)]
pub struct Registry {
    /// Adapter name (one of [`provider`]).
    pub name: String,
    /// Cluster the adapter watches; distinguishes multiple clusters of the
    /// same provider.
    pub cluster_id: String,
    /// Query face.
    pub discovery: Arc<dyn ServiceDiscovery>,
    /// Event face.
    pub controller: Arc<dyn RegistryController>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_serializes_camel_case() {
        let svc = Service {
            hostname: "web.prod.svc.cluster.local".to_string(),
            address: Some("10.0.0.1".to_string()),
            ports: vec![Port {
                name: "http".to_string(),
                port: 80,
                protocol: "http".to_string(),
            }],
            cluster_id: "Kubernetes".to_string(),
        };
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["clusterId"], "Kubernetes");
        assert_eq!(json["ports"][0]["port"], 80);
    }
}
