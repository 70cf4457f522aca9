//! Ingress-derived configuration
//!
//! When the mesh runs in an ingress mode, cluster Ingress resources are
//! projected into gateway and route objects and layered over the config
//! aggregate as an additional read-through child.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use super::memory::MemoryController;
use super::{collections, ConfigEntry, ConfigStore, ConfigStoreCache, EventHandler};
use crate::lifecycle::ShutdownSignal;
use crate::mesh::IngressMode;

/// Ingress class claimed by the mesh.
pub const INGRESS_CLASS: &str = "trellis";

/// Annotation carrying the ingress class on older resources.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Config child derived from claimed Ingress resources.
pub struct IngressConfigStore {
    client: kube::Client,
    mode: IngressMode,
    controller: Arc<MemoryController>,
    sources: Mutex<HashMap<String, Vec<ConfigEntry>>>,
}

impl IngressConfigStore {
    /// Create the store. `mode` decides which resources are claimed.
    pub fn new(client: kube::Client, mode: IngressMode) -> Arc<Self> {
        Arc::new(Self {
            client,
            mode,
            controller: Arc::new(MemoryController::new()),
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Whether this ingress belongs to the mesh under the configured mode.
    fn claims(&self, ingress: &Ingress) -> bool {
        let annotated_class = ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
            .map(String::as_str);
        let spec_class = ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref());
        let class = annotated_class.or(spec_class);

        match self.mode {
            IngressMode::Off => false,
            IngressMode::Strict => class == Some(INGRESS_CLASS),
            IngressMode::Default => class.is_none() || class == Some(INGRESS_CLASS),
        }
    }

    fn convert(ingress: &Ingress) -> Vec<ConfigEntry> {
        let name = ingress.name_any();
        let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
        let Some(spec) = ingress.spec.as_ref() else {
            return Vec::new();
        };

        let mut hosts = Vec::new();
        let mut routes = Vec::new();
        for rule in spec.rules.as_deref().unwrap_or_default() {
            let host = rule.host.clone().unwrap_or_else(|| "*".to_string());
            hosts.push(host.clone());
            for path in rule
                .http
                .as_ref()
                .map(|h| h.paths.as_slice())
                .unwrap_or_default()
            {
                let backend = path.backend.service.as_ref();
                routes.push(json!({
                    "host": host,
                    "path": path.path.clone().unwrap_or_else(|| "/".to_string()),
                    "service": backend.map(|s| s.name.clone()),
                    "port": backend
                        .and_then(|s| s.port.as_ref())
                        .and_then(|p| p.number),
                }));
            }
        }

        vec![
            ConfigEntry {
                kind: collections::GATEWAYS.to_string(),
                name: format!("{name}-ingress"),
                namespace: namespace.clone(),
                spec: json!({ "hosts": hosts, "port": 80 }),
                ..Default::default()
            },
            ConfigEntry {
                kind: collections::ROUTES.to_string(),
                name: format!("{name}-ingress"),
                namespace,
                spec: json!({ "routes": routes }),
                ..Default::default()
            },
        ]
    }

    fn reconcile(&self) {
        let sources = self.sources.lock().expect("sources lock poisoned");
        for kind in [collections::GATEWAYS, collections::ROUTES] {
            let desired: Vec<ConfigEntry> = sources
                .values()
                .flatten()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect();
            self.controller.apply_snapshot(kind, desired);
        }
    }

    fn apply(&self, ingress: &Ingress) {
        let key = format!(
            "{}/{}",
            ingress.metadata.namespace.clone().unwrap_or_default(),
            ingress.name_any()
        );
        let mut sources = self.sources.lock().expect("sources lock poisoned");
        if self.claims(ingress) {
            sources.insert(key, Self::convert(ingress));
        } else {
            sources.remove(&key);
        }
        drop(sources);
        self.reconcile();
    }

    fn delete(&self, ingress: &Ingress) {
        let key = format!(
            "{}/{}",
            ingress.metadata.namespace.clone().unwrap_or_default(),
            ingress.name_any()
        );
        self.sources
            .lock()
            .expect("sources lock poisoned")
            .remove(&key);
        self.reconcile();
    }
}

impl ConfigStore for IngressConfigStore {
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry> {
        self.controller.get(kind, name, namespace)
    }

    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry> {
        self.controller.list(kind, namespace)
    }
}

#[async_trait]
impl ConfigStoreCache for IngressConfigStore {
    fn register_event_handler(&self, handler: EventHandler) {
        self.controller.register_event_handler(handler);
    }

    fn has_synced(&self) -> bool {
        self.controller.has_synced()
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

        info!(mode = ?self.mode, "watching ingress resources");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(ing)))
                    | Some(Ok(watcher::Event::Apply(ing))) => self.apply(&ing),
                    Some(Ok(watcher::Event::InitDone)) => self.controller.mark_synced(),
                    Some(Ok(watcher::Event::Delete(ing))) => self.delete(&ing),
                    Some(Err(e)) => warn!(error = %e, "ingress watch error"),
                    None => break,
                }
            }
        }
        info!("ingress config store stopped");
    }
}
