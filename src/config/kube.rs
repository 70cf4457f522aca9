//! Cluster-backed configuration store
//!
//! The default config source when neither explicit sources nor a local
//! directory are configured: configuration objects live as multi-document
//! YAML inside labeled ConfigMaps in the root namespace. A watcher keeps a
//! memory controller reconciled with the labeled set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{info, warn};

use super::memory::MemoryController;
use super::monitor::parse_documents;
use super::{collections, ConfigEntry, ConfigStore, ConfigStoreCache, EventHandler};
use crate::lifecycle::ShutdownSignal;

/// Label selecting configuration ConfigMaps.
pub const CONFIG_LABEL: &str = "trellis.io/config=true";

/// ConfigMap-backed store for one namespace.
pub struct KubeConfigStore {
    client: kube::Client,
    namespace: String,
    controller: Arc<MemoryController>,
    // ConfigMap name -> objects parsed from it; flattened per kind on every
    // change so deletions fall out of the reconcile.
    sources: Mutex<HashMap<String, Vec<ConfigEntry>>>,
}

impl KubeConfigStore {
    /// Create a store watching the given namespace.
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client,
            namespace: namespace.into(),
            controller: Arc::new(MemoryController::new()),
            sources: Mutex::new(HashMap::new()),
        })
    }

    fn parse_config_map(cm: &ConfigMap) -> Vec<ConfigEntry> {
        let name = cm.name_any();
        let mut out = Vec::new();
        for (key, content) in cm.data.clone().unwrap_or_default() {
            out.extend(parse_documents(&format!("{name}/{key}"), &content));
        }
        out
    }

    fn reconcile(&self) {
        let sources = self.sources.lock().expect("sources lock poisoned");
        for kind in collections::all() {
            let desired: Vec<ConfigEntry> = sources
                .values()
                .flatten()
                .filter(|e| e.kind == *kind)
                .cloned()
                .collect();
            self.controller.apply_snapshot(kind, desired);
        }
    }

    fn apply(&self, cm: &ConfigMap) {
        let entries = Self::parse_config_map(cm);
        self.sources
            .lock()
            .expect("sources lock poisoned")
            .insert(cm.name_any(), entries);
        self.reconcile();
    }

    fn delete(&self, cm: &ConfigMap) {
        self.sources
            .lock()
            .expect("sources lock poisoned")
            .remove(&cm.name_any());
        self.reconcile();
    }
}

impl ConfigStore for KubeConfigStore {
    fn get(&self, kind: &str, name: &str, namespace: &str) -> Option<ConfigEntry> {
        self.controller.get(kind, name, namespace)
    }

    fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ConfigEntry> {
        self.controller.list(kind, namespace)
    }
}

#[async_trait]
impl ConfigStoreCache for KubeConfigStore {
    fn register_event_handler(&self, handler: EventHandler) {
        self.controller.register_event_handler(handler);
    }

    fn has_synced(&self) -> bool {
        self.controller.has_synced()
    }

    async fn run(&self, mut stop: ShutdownSignal) {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(CONFIG_LABEL);
        let mut stream = watcher::watcher(api, config).boxed();

        info!(namespace = %self.namespace, "watching configuration ConfigMaps");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(cm)))
                    | Some(Ok(watcher::Event::Apply(cm))) => self.apply(&cm),
                    Some(Ok(watcher::Event::InitDone)) => self.controller.mark_synced(),
                    Some(Ok(watcher::Event::Delete(cm))) => self.delete(&cm),
                    Some(Err(e)) => warn!(error = %e, "configuration watch error"),
                    None => break,
                }
            }
        }
        info!("cluster config store stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<KubeConfigStore> {
        let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        KubeConfigStore::new(client, "trellis-system")
    }

    fn config_map(name: &str, docs: &str) -> ConfigMap {
        ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("trellis-system".to_string()),
                ..Default::default()
            },
            data: Some([("objects.yaml".to_string(), docs.to_string())].into_iter().collect()),
            ..Default::default()
        }
    }

    #[test]
    fn config_maps_reconcile_into_the_store() {
        let store = store();
        store.apply(&config_map(
            "routes",
            "kind: routes\nname: web\nnamespace: prod\nspec:\n  hosts: [web]\n",
        ));
        assert!(store.get(collections::ROUTES, "web", "prod").is_some());

        // Replacing the ConfigMap replaces its objects.
        store.apply(&config_map(
            "routes",
            "kind: routes\nname: api\nnamespace: prod\nspec:\n  hosts: [api]\n",
        ));
        assert!(store.get(collections::ROUTES, "web", "prod").is_none());
        assert!(store.get(collections::ROUTES, "api", "prod").is_some());

        store.delete(&config_map("routes", ""));
        assert!(store.list(collections::ROUTES, None).is_empty());
    }
}
