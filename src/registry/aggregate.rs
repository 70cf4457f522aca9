//! Union of service registries
//!
//! The aggregate holds the live registry set. Most members are fixed at
//! startup; the multicluster coordinator adds and removes per-cluster
//! registries at runtime, so the set is mutex-guarded and handlers registered
//! on the aggregate are replayed onto late-joining members.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    InstanceHandler, Registry, RegistryController, Service, ServiceDiscovery, ServiceHandler,
    ServiceInstance,
};
use crate::lifecycle::ShutdownSignal;
use crate::Result;

/// Composite of child registries behind the two registry faces.
#[derive(Default)]
pub struct ServiceAggregate {
    registries: RwLock<Vec<Registry>>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
    // Present once run() has been called; late-added registries are spawned
    // against it immediately.
    stop: RwLock<Option<ShutdownSignal>>,
}

impl ServiceAggregate {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registry. Handlers already registered on the aggregate are
    /// appended to it, and if the aggregate is running the registry is
    /// started immediately.
    pub fn add_registry(&self, registry: Registry) {
        info!(name = %registry.name, cluster = %registry.cluster_id, "adding registry adapter");

        for handler in self
            .service_handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
        {
            registry.controller.append_service_handler(handler.clone());
        }
        for handler in self
            .instance_handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
        {
            registry.controller.append_instance_handler(handler.clone());
        }

        let running = self.stop.read().expect("stop lock poisoned").clone();
        if let Some(stop) = running {
            let controller = registry.controller.clone();
            tokio::spawn(async move { controller.run(stop).await });
        }

        self.registries
            .write()
            .expect("registry lock poisoned")
            .push(registry);
    }

    /// Remove the registry for a cluster, returning it if present.
    pub fn delete_registry(&self, cluster_id: &str) -> Option<Registry> {
        let mut registries = self.registries.write().expect("registry lock poisoned");
        let idx = registries.iter().position(|r| r.cluster_id == cluster_id)?;
        let removed = registries.remove(idx);
        info!(name = %removed.name, cluster = %cluster_id, "removed registry adapter");
        Some(removed)
    }

    /// Snapshot of the current registry set.
    pub fn registries(&self) -> Vec<Registry> {
        self.registries
            .read()
            .expect("registry lock poisoned")
            .clone()
    }

    /// Whether a registry with this provider name is present.
    pub fn has_registry_named(&self, name: &str) -> bool {
        self.registries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .any(|r| r.name == name)
    }
}

impl ServiceDiscovery for ServiceAggregate {
    fn services(&self) -> Result<Vec<Service>> {
        let registries = self.registries();
        let mut out = Vec::new();
        for registry in &registries {
            match registry.discovery.services() {
                Ok(services) => out.extend(services),
                Err(e) => {
                    warn!(name = %registry.name, cluster = %registry.cluster_id, error = %e,
                        "registry query failed, serving partial results");
                }
            }
        }
        Ok(out)
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.registries()
            .iter()
            .find_map(|registry| registry.discovery.get_service(hostname))
    }

    fn instances(&self, hostname: &str) -> Vec<ServiceInstance> {
        self.registries()
            .iter()
            .flat_map(|registry| registry.discovery.instances(hostname))
            .collect()
    }
}

#[async_trait]
impl RegistryController for ServiceAggregate {
    fn append_service_handler(&self, handler: ServiceHandler) {
        for registry in self.registries().iter() {
            registry.controller.append_service_handler(handler.clone());
        }
        self.service_handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    fn append_instance_handler(&self, handler: InstanceHandler) {
        for registry in self.registries().iter() {
            registry.controller.append_instance_handler(handler.clone());
        }
        self.instance_handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.registries()
            .iter()
            .all(|registry| registry.controller.has_synced())
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        {
            let mut slot = self.stop.write().expect("stop lock poisoned");
            *slot = Some(stop.clone());
        }
        for registry in self.registries() {
            let controller = registry.controller.clone();
            let child_stop = stop.clone();
            tokio::spawn(async move { controller.run(child_stop).await });
        }
        stop.recv().await;
    }
}
