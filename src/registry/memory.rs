//! In-memory service registry
//!
//! Used by the `Mock` provider and as scaffolding in tests: services and
//! instances are inserted directly, events fire synchronously.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{
    Event, InstanceHandler, RegistryController, Service, ServiceDiscovery, ServiceHandler,
    ServiceInstance,
};
use crate::lifecycle::ShutdownSignal;
use crate::Result;

/// Map-backed discovery with synchronous event dispatch.
#[derive(Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<String, Service>>,
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service, firing the matching event.
    pub fn set_service(&self, service: Service) {
        let event = {
            let mut services = self.services.write().expect("service lock poisoned");
            match services.insert(service.hostname.clone(), service.clone()) {
                Some(_) => Event::Update,
                None => Event::Add,
            }
        };
        for handler in self
            .service_handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
        {
            handler(&service, event);
        }
    }

    /// Remove a service, firing a delete event if it existed.
    pub fn delete_service(&self, hostname: &str) {
        let removed = {
            let mut services = self.services.write().expect("service lock poisoned");
            services.remove(hostname)
        };
        if let Some(service) = removed {
            self.instances
                .write()
                .expect("instance lock poisoned")
                .remove(hostname);
            for handler in self
                .service_handlers
                .read()
                .expect("handler lock poisoned")
                .iter()
            {
                handler(&service, Event::Delete);
            }
        }
    }

    /// Replace the instance set for a hostname.
    pub fn set_instances(&self, hostname: impl Into<String>, instances: Vec<ServiceInstance>) {
        let hostname = hostname.into();
        let handlers = self.instance_handlers.read().expect("handler lock poisoned");
        for instance in &instances {
            for handler in handlers.iter() {
                handler(instance, Event::Update);
            }
        }
        drop(handlers);
        self.instances
            .write()
            .expect("instance lock poisoned")
            .insert(hostname, instances);
    }
}

impl ServiceDiscovery for MemoryRegistry {
    fn services(&self) -> Result<Vec<Service>> {
        let services = self.services.read().expect("service lock poisoned");
        let mut out: Vec<Service> = services.values().cloned().collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(out)
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.services
            .read()
            .expect("service lock poisoned")
            .get(hostname)
            .cloned()
    }

    fn instances(&self, hostname: &str) -> Vec<ServiceInstance> {
        self.instances
            .read()
            .expect("instance lock poisoned")
            .get(hostname)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RegistryController for MemoryRegistry {
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
        true
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        stop.recv().await;
    }
}
