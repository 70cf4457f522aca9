//! Cluster-API-backed service registry
//!
//! Watches Services and Endpoints of one cluster and projects them onto the
//! registry model. The same adapter serves both the primary cluster and the
//! peer clusters added at runtime by the multicluster coordinator; only the
//! client and cluster id differ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1 as corev1;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use super::{
    Event, InstanceHandler, Port, RegistryController, Service, ServiceDiscovery, ServiceHandler,
    ServiceInstance,
};
use crate::lifecycle::ShutdownSignal;
use crate::mesh::MeshNetworks;
use crate::Result;

/// Kubernetes registry adapter for one cluster.
pub struct KubeRegistry {
    client: kube::Client,
    cluster_id: String,
    domain_suffix: String,
    services: RwLock<HashMap<String, Service>>,
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
    services_synced: AtomicBool,
    endpoints_synced: AtomicBool,
    network: RwLock<Option<String>>,
}

impl KubeRegistry {
    /// Create an adapter over a cluster client.
    pub fn new(
        client: kube::Client,
        cluster_id: impl Into<String>,
        domain_suffix: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cluster_id: cluster_id.into(),
            domain_suffix: domain_suffix.into(),
            services: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            service_handlers: RwLock::new(Vec::new()),
            instance_handlers: RwLock::new(Vec::new()),
            services_synced: AtomicBool::new(false),
            endpoints_synced: AtomicBool::new(false),
            network: RwLock::new(None),
        })
    }

    /// Cluster this adapter watches.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Rebind the network this cluster belongs to from the current topology.
    /// Applies to all subsequent instance queries.
    pub fn init_network_lookup(&self, networks: &MeshNetworks) {
        let network = networks.networks.iter().find_map(|(name, nw)| {
            nw.endpoints
                .iter()
                .any(|ep| ep.from_registry.as_deref() == Some(self.cluster_id.as_str()))
                .then(|| name.clone())
        });
        debug!(cluster = %self.cluster_id, ?network, "network lookup rebound");
        *self.network.write().expect("network lock poisoned") = network;
    }

    fn hostname(&self, name: &str, namespace: &str) -> String {
        format!("{name}.{namespace}.svc.{}", self.domain_suffix)
    }

    fn convert_service(&self, svc: &corev1::Service) -> Option<Service> {
        let name = svc.metadata.name.as_deref()?;
        let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
        let spec = svc.spec.as_ref()?;

        let address = spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .map(str::to_string);

        let ports = spec
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| {
                let name = p.name.clone().unwrap_or_default();
                Port {
                    protocol: protocol_from_port_name(&name),
                    name,
                    port: p.port as u16,
                }
            })
            .collect();

        Some(Service {
            hostname: self.hostname(name, namespace),
            address,
            ports,
            cluster_id: self.cluster_id.clone(),
        })
    }

    fn convert_endpoints(&self, ep: &corev1::Endpoints) -> (String, Vec<ServiceInstance>) {
        let name = ep.metadata.name.as_deref().unwrap_or_default();
        let namespace = ep.metadata.namespace.as_deref().unwrap_or("default");
        let hostname = self.hostname(name, namespace);
        let network = self.network.read().expect("network lock poisoned").clone();

        let mut out = Vec::new();
        for subset in ep.subsets.as_deref().unwrap_or_default() {
            let ports = subset.ports.as_deref().unwrap_or_default();
            for addr in subset.addresses.as_deref().unwrap_or_default() {
                for port in ports {
                    out.push(ServiceInstance {
                        hostname: hostname.clone(),
                        address: addr.ip.clone(),
                        port: port.port as u16,
                        labels: Default::default(),
                        network: network.clone(),
                    });
                }
            }
        }
        (hostname, out)
    }

    fn apply_service(&self, svc: &corev1::Service, during_init: bool) {
        let Some(converted) = self.convert_service(svc) else {
            return;
        };
        let event = {
            let mut services = self.services.write().expect("service lock poisoned");
            match services.insert(converted.hostname.clone(), converted.clone()) {
                Some(_) => Event::Update,
                None => Event::Add,
            }
        };
        if during_init {
            return;
        }
        for handler in self
            .service_handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
        {
            handler(&converted, event);
        }
    }

    fn delete_service(&self, svc: &corev1::Service) {
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
        let hostname = self.hostname(name, namespace);
        let removed = self
            .services
            .write()
            .expect("service lock poisoned")
            .remove(&hostname);
        self.instances
            .write()
            .expect("instance lock poisoned")
            .remove(&hostname);
        if let Some(service) = removed {
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

    fn apply_endpoints(&self, ep: &corev1::Endpoints, during_init: bool) {
        let (hostname, converted) = self.convert_endpoints(ep);
        {
            let mut instances = self.instances.write().expect("instance lock poisoned");
            instances.insert(hostname, converted.clone());
        }
        if during_init {
            return;
        }
        let handlers = self.instance_handlers.read().expect("handler lock poisoned");
        for instance in &converted {
            for handler in handlers.iter() {
                handler(instance, Event::Update);
            }
        }
    }
}

/// Map the port naming convention onto a protocol.
fn protocol_from_port_name(name: &str) -> String {
    let prefix = name.split('-').next().unwrap_or_default();
    match prefix {
        "http" | "http2" | "grpc" | "https" | "tls" | "tcp" | "udp" => prefix.to_string(),
        _ => "tcp".to_string(),
    }
}

impl ServiceDiscovery for KubeRegistry {
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
        // The network tag is stamped at query time so a topology rebind
        // applies to endpoints recorded before it.
        let network = self.network.read().expect("network lock poisoned").clone();
        self.instances
            .read()
            .expect("instance lock poisoned")
            .get(hostname)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut instance| {
                instance.network = network.clone();
                instance
            })
            .collect()
    }
}

#[async_trait]
impl RegistryController for KubeRegistry {
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
        self.services_synced.load(Ordering::SeqCst) && self.endpoints_synced.load(Ordering::SeqCst)
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        let services: Api<corev1::Service> = Api::all(self.client.clone());
        let endpoints: Api<corev1::Endpoints> = Api::all(self.client.clone());

        let mut service_stream = watcher::watcher(services, watcher::Config::default()).boxed();
        let mut endpoint_stream = watcher::watcher(endpoints, watcher::Config::default()).boxed();

        info!(cluster = %self.cluster_id, "kubernetes registry watching services");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = service_stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(svc))) => self.apply_service(&svc, true),
                    Some(Ok(watcher::Event::InitDone)) => {
                        self.services_synced.store(true, Ordering::SeqCst);
                    }
                    Some(Ok(watcher::Event::Apply(svc))) => self.apply_service(&svc, false),
                    Some(Ok(watcher::Event::Delete(svc))) => self.delete_service(&svc),
                    Some(Err(e)) => {
                        warn!(cluster = %self.cluster_id, error = %e, "service watch error");
                    }
                    None => break,
                },
                event = endpoint_stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(ep))) => self.apply_endpoints(&ep, true),
                    Some(Ok(watcher::Event::InitDone)) => {
                        self.endpoints_synced.store(true, Ordering::SeqCst);
                    }
                    Some(Ok(watcher::Event::Apply(ep))) => self.apply_endpoints(&ep, false),
                    Some(Ok(watcher::Event::Delete(ep))) => {
                        let name = ep.name_any();
                        let namespace = ep.metadata.namespace.as_deref().unwrap_or("default");
                        let hostname = self.hostname(&name, namespace);
                        self.instances
                            .write()
                            .expect("instance lock poisoned")
                            .remove(&hostname);
                    }
                    Some(Err(e)) => {
                        warn!(cluster = %self.cluster_id, error = %e, "endpoints watch error");
                    }
                    None => break,
                },
            }
        }
        info!(cluster = %self.cluster_id, "kubernetes registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Network, NetworkEndpoints};

    fn registry() -> Arc<KubeRegistry> {
        // Client construction needs no live cluster until run() is called.
        let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        KubeRegistry::new(client, "Kubernetes", "cluster.local")
    }

    fn kube_service(name: &str, namespace: &str, cluster_ip: &str, port: i32) -> corev1::Service {
        corev1::Service {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(corev1::ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ports: Some(vec![corev1::ServicePort {
                    name: Some("http-web".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn protocol_convention() {
        assert_eq!(protocol_from_port_name("http-web"), "http");
        assert_eq!(protocol_from_port_name("grpc"), "grpc");
        assert_eq!(protocol_from_port_name("metrics"), "tcp");
        assert_eq!(protocol_from_port_name(""), "tcp");
    }

    #[tokio::test]
    async fn converts_services_with_mesh_hostnames() {
        let registry = registry();
        registry.apply_service(&kube_service("web", "prod", "10.0.0.5", 80), false);

        let got = registry
            .get_service("web.prod.svc.cluster.local")
            .expect("service present");
        assert_eq!(got.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(got.ports[0].protocol, "http");
        assert_eq!(got.cluster_id, "Kubernetes");
    }

    #[tokio::test]
    async fn headless_services_have_no_address() {
        let registry = registry();
        registry.apply_service(&kube_service("db", "prod", "None", 5432), false);

        let got = registry.get_service("db.prod.svc.cluster.local").unwrap();
        assert!(got.address.is_none());
    }

    #[tokio::test]
    async fn network_lookup_tags_instances() {
        let registry = registry();
        let mut networks = MeshNetworks::default();
        networks.networks.insert(
            "nw-east".to_string(),
            Network {
                endpoints: vec![NetworkEndpoints {
                    from_registry: Some("Kubernetes".to_string()),
                    from_cidr: None,
                }],
                gateways: vec![],
            },
        );
        registry.init_network_lookup(&networks);

        let ep = corev1::Endpoints {
            metadata: kube::api::ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![corev1::EndpointSubset {
                addresses: Some(vec![corev1::EndpointAddress {
                    ip: "10.2.0.9".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![corev1::EndpointPort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        };
        registry.apply_endpoints(&ep, false);

        let instances = registry.instances("web.prod.svc.cluster.local");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].network.as_deref(), Some("nw-east"));
    }
}
