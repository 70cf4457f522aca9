//! Consul catalog service registry
//!
//! Polls a Consul agent's catalog API on an interval and reconciles the
//! result into the registry model. Poll failures keep the last-known view.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    Event, InstanceHandler, Port, RegistryController, Service, ServiceDiscovery, ServiceHandler,
    ServiceInstance,
};
use crate::lifecycle::ShutdownSignal;
use crate::registry::provider;
use crate::{Error, Result};

/// Catalog entry as returned by `/v1/catalog/service/{name}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    address: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_port: u16,
    #[serde(default)]
    service_meta: BTreeMap<String, String>,
}

/// Consul registry adapter.
pub struct ConsulRegistry {
    server_url: String,
    interval: Duration,
    http: reqwest::Client,
    services: RwLock<HashMap<String, Service>>,
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
    synced: AtomicBool,
}

impl ConsulRegistry {
    /// Create an adapter polling the given agent URL.
    pub fn new(server_url: impl Into<String>, interval: Duration) -> Result<Arc<Self>> {
        let server_url = server_url.into();
        reqwest::Url::parse(&server_url)
            .map_err(|e| Error::registry(format!("invalid consul url {server_url:?}: {e}")))?;
        Ok(Arc::new(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            interval,
            http: reqwest::Client::new(),
            services: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            service_handlers: RwLock::new(Vec::new()),
            instance_handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }))
    }

    fn hostname(name: &str) -> String {
        format!("{name}.service.consul")
    }

    async fn fetch_catalog(&self) -> Result<HashMap<String, Vec<CatalogEntry>>> {
        let names: HashMap<String, Vec<String>> = self
            .http
            .get(format!("{}/v1/catalog/services", self.server_url))
            .send()
            .await
            .map_err(|e| Error::registry(format!("consul catalog query failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::registry(format!("consul catalog response malformed: {e}")))?;

        let mut out = HashMap::new();
        for name in names.into_keys() {
            let entries: Vec<CatalogEntry> = self
                .http
                .get(format!("{}/v1/catalog/service/{name}", self.server_url))
                .send()
                .await
                .map_err(|e| Error::registry(format!("consul service query failed: {e}")))?
                .json()
                .await
                .map_err(|e| Error::registry(format!("consul service response malformed: {e}")))?;
            out.insert(name, entries);
        }
        Ok(out)
    }

    fn reconcile(&self, catalog: HashMap<String, Vec<CatalogEntry>>) {
        let mut desired_services = HashMap::new();
        let mut desired_instances = HashMap::new();

        for (name, entries) in catalog {
            let hostname = Self::hostname(&name);
            let port = entries.first().map(|e| e.service_port).unwrap_or_default();
            desired_services.insert(
                hostname.clone(),
                Service {
                    hostname: hostname.clone(),
                    address: None,
                    ports: vec![Port {
                        name: "tcp".to_string(),
                        port,
                        protocol: "tcp".to_string(),
                    }],
                    cluster_id: provider::CONSUL.to_string(),
                },
            );
            let instances: Vec<ServiceInstance> = entries
                .iter()
                .map(|entry| {
                    let address = if entry.service_address.is_empty() {
                        entry.address.clone()
                    } else {
                        entry.service_address.clone()
                    };
                    ServiceInstance {
                        hostname: hostname.clone(),
                        address,
                        port: entry.service_port,
                        labels: entry.service_meta.clone(),
                        network: None,
                    }
                })
                .collect();
            desired_instances.insert(hostname, instances);
        }

        let mut events = Vec::new();
        {
            let mut services = self.services.write().expect("service lock poisoned");
            for (hostname, service) in &desired_services {
                match services.get(hostname) {
                    None => events.push((service.clone(), Event::Add)),
                    Some(current) if current != service => {
                        events.push((service.clone(), Event::Update))
                    }
                    Some(_) => {}
                }
            }
            services.retain(|hostname, service| {
                let keep = desired_services.contains_key(hostname);
                if !keep {
                    events.push((service.clone(), Event::Delete));
                }
                keep
            });
            for (hostname, service) in desired_services {
                services.insert(hostname, service);
            }
        }
        *self.instances.write().expect("instance lock poisoned") = desired_instances;

        let handlers = self.service_handlers.read().expect("handler lock poisoned");
        for (service, event) in &events {
            debug!(hostname = %service.hostname, ?event, "consul catalog change");
            for handler in handlers.iter() {
                handler(service, *event);
            }
        }
    }
}

impl ServiceDiscovery for ConsulRegistry {
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
impl RegistryController for ConsulRegistry {
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
        self.synced.load(Ordering::SeqCst)
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        info!(url = %self.server_url, "consul registry polling catalog");
        loop {
            match self.fetch_catalog().await {
                Ok(catalog) => {
                    self.reconcile(catalog);
                    self.synced.store(true, Ordering::SeqCst);
                }
                Err(e) => warn!(error = %e, "consul poll failed, keeping last view"),
            }
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("consul registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(ConsulRegistry::new("not a url", Duration::from_secs(2)).is_err());
        assert!(ConsulRegistry::new("http://127.0.0.1:8500", Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn reconcile_diffs_catalog() {
        use std::sync::atomic::AtomicUsize;

        let registry = ConsulRegistry::new("http://127.0.0.1:8500", Duration::from_secs(2)).unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        registry.append_service_handler(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut catalog = HashMap::new();
        catalog.insert(
            "web".to_string(),
            vec![CatalogEntry {
                address: "10.3.0.1".to_string(),
                service_address: String::new(),
                service_port: 8080,
                service_meta: BTreeMap::new(),
            }],
        );
        registry.reconcile(catalog);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        let got = registry.get_service("web.service.consul").unwrap();
        assert_eq!(got.cluster_id, provider::CONSUL);
        let instances = registry.instances("web.service.consul");
        assert_eq!(instances[0].address, "10.3.0.1");
        assert_eq!(instances[0].port, 8080);

        // Empty catalog removes the service.
        registry.reconcile(HashMap::new());
        assert_eq!(events.load(Ordering::SeqCst), 2);
        assert!(registry.get_service("web.service.consul").is_none());
    }
}
