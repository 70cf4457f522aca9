//! Peer-cluster coordination
//!
//! Peer clusters register themselves by placing a labeled Secret in the
//! cluster-registry namespace; each data entry is a kubeconfig keyed by the
//! peer's cluster id. The coordinator watches that collection and keeps the
//! service aggregate's registry set equal to the secret set: an added secret
//! hot-adds per-cluster registries, a deleted secret removes them. Events
//! are handled by a single task, so concurrent adds and removes serialize.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::discovery::{PushRequest, UpdateSink};
use crate::lifecycle::ShutdownSignal;
use crate::mesh::MeshNetworks;
use crate::registry::aggregate::ServiceAggregate;
use crate::registry::kube::KubeRegistry;
use crate::registry::{provider, Registry};
use crate::Result;

/// Label selecting peer-cluster secrets.
pub const MULTICLUSTER_LABEL: &str = "trellis.io/multicluster=true";

struct ClusterHandle {
    cluster_id: String,
    registry: Arc<KubeRegistry>,
}

/// Watches the peer-cluster secret collection and maintains the aggregate.
pub struct Multicluster {
    client: kube::Client,
    namespace: String,
    domain_suffix: String,
    aggregate: Arc<ServiceAggregate>,
    sink: Arc<dyn UpdateSink>,
    networks: watch::Receiver<Arc<MeshNetworks>>,
    // Secret name -> clusters created from it.
    remotes: Mutex<HashMap<String, Vec<ClusterHandle>>>,
}

impl Multicluster {
    /// Create the coordinator.
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        domain_suffix: impl Into<String>,
        aggregate: Arc<ServiceAggregate>,
        sink: Arc<dyn UpdateSink>,
        networks: watch::Receiver<Arc<MeshNetworks>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            namespace: namespace.into(),
            domain_suffix: domain_suffix.into(),
            aggregate,
            sink,
            networks,
            remotes: Mutex::new(HashMap::new()),
        })
    }

    /// Cluster ids currently registered, across all secrets.
    pub fn cluster_ids(&self) -> Vec<String> {
        let remotes = self.remotes.lock().expect("remotes lock poisoned");
        let mut ids: Vec<String> = remotes
            .values()
            .flatten()
            .map(|h| h.cluster_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Rebind every remote registry's network lookup to a new topology.
    pub fn reload_network_lookup(&self, networks: &MeshNetworks) {
        let remotes = self.remotes.lock().expect("remotes lock poisoned");
        for handle in remotes.values().flatten() {
            handle.registry.init_network_lookup(networks);
        }
    }

    fn is_registered(&self, cluster_id: &str) -> bool {
        let remotes = self.remotes.lock().expect("remotes lock poisoned");
        remotes
            .values()
            .flatten()
            .any(|h| h.cluster_id == cluster_id)
    }

    async fn remote_client(&self, kubeconfig_yaml: &str) -> Result<kube::Client> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| crate::Error::registry(format!("invalid peer kubeconfig: {e}")))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| crate::Error::registry(format!("peer kubeconfig rejected: {e}")))?;
        Ok(kube::Client::try_from(config)?)
    }

    /// Register every cluster carried by a secret. Already-registered
    /// clusters are left untouched, so re-applying a secret is idempotent.
    pub async fn add_secret(&self, secret: &Secret) {
        let secret_name = secret.name_any();
        for (cluster_id, kubeconfig) in secret.data.clone().unwrap_or_default() {
            if self.is_registered(&cluster_id) {
                continue;
            }
            let yaml = String::from_utf8_lossy(&kubeconfig.0).to_string();
            let client = match self.remote_client(&yaml).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(secret = %secret_name, cluster = %cluster_id, error = %e,
                        "skipping unusable peer cluster credentials");
                    continue;
                }
            };

            info!(secret = %secret_name, cluster = %cluster_id, "adding peer cluster registry");
            let registry = KubeRegistry::new(client, cluster_id.clone(), self.domain_suffix.clone());
            registry.init_network_lookup(&self.networks.borrow().clone());

            self.aggregate.add_registry(Registry {
                name: provider::KUBERNETES.to_string(),
                cluster_id: cluster_id.clone(),
                discovery: registry.clone(),
                controller: registry.clone(),
            });
            self.remotes
                .lock()
                .expect("remotes lock poisoned")
                .entry(secret_name.clone())
                .or_default()
                .push(ClusterHandle {
                    cluster_id,
                    registry,
                });
            self.sink.config_update(PushRequest::full());
        }
    }

    /// Remove every cluster that was registered from a secret.
    pub fn remove_secret(&self, secret_name: &str) {
        let handles = self
            .remotes
            .lock()
            .expect("remotes lock poisoned")
            .remove(secret_name);
        let Some(handles) = handles else {
            return;
        };
        for handle in handles {
            info!(secret = %secret_name, cluster = %handle.cluster_id, "removing peer cluster registry");
            self.aggregate.delete_registry(&handle.cluster_id);
        }
        self.sink.config_update(PushRequest::full());
    }

    /// Watch the secret collection until shutdown.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(MULTICLUSTER_LABEL);
        let mut stream = watcher::watcher(api, config).boxed();

        info!(namespace = %self.namespace, "watching peer cluster secrets");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitApply(secret)))
                    | Some(Ok(watcher::Event::Apply(secret))) => {
                        self.add_secret(&secret).await;
                    }
                    Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Ok(watcher::Event::Delete(secret))) => {
                        self.remove_secret(&secret.name_any());
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "peer cluster secret watch error");
                    }
                    None => break,
                }
            }
        }
        info!("multicluster coordinator stopped");
    }
}
