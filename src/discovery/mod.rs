//! Discovery push engine and its wiring
//!
//! The push engine is the fan-in point of the control plane: mesh reloads,
//! config-store changes, and service-registry changes all enqueue a
//! [`PushRequest`], and a single debounced loop turns bursts of requests into
//! coherent pushes broadcast to connected data-plane streams.
//!
//! Producers never call the engine directly; they hold an [`UpdateSink`]
//! injected at construction. That keeps every subsystem independent of the
//! push engine's type, and the engine free to reference the stores those
//! subsystems populate.

pub mod admin;
pub mod mux;

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::config::ConfigStoreCache;
use crate::mesh::{MeshConfig, MeshNetworks};
use crate::lifecycle::ShutdownSignal;
use crate::proto::aggregated_discovery_server::{AggregatedDiscovery, AggregatedDiscoveryServer};
use crate::proto::{DiscoveryRequest, DiscoveryResponse, Resource};
use crate::registry::aggregate::ServiceAggregate;
use crate::registry::{RegistryController, ServiceDiscovery};

/// Quiet period before a push fires.
pub const DEBOUNCE_AFTER: Duration = Duration::from_millis(100);

/// Upper bound on how long a continuous stream of updates may delay a push.
pub const DEBOUNCE_MAX: Duration = Duration::from_secs(1);

/// Pseudo type name under which the service snapshot is served.
pub const TYPE_SERVICES: &str = "services";

/// A request to recompute and broadcast the discovery snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushRequest {
    /// Whether the whole snapshot must be recomputed.
    pub full: bool,
    /// Names of the types that changed; empty means unknown, push everything.
    pub types_updated: BTreeSet<String>,
}

impl PushRequest {
    /// A full push with no type attribution.
    pub fn full() -> Self {
        Self {
            full: true,
            types_updated: BTreeSet::new(),
        }
    }

    /// A full push attributed to the given changed types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            full: true,
            types_updated: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Fold another request into this one.
    pub fn merge(&mut self, other: PushRequest) {
        self.full |= other.full;
        self.types_updated.extend(other.types_updated);
    }
}

/// Where producers send change notifications. Implementations must not
/// block: enqueue and return.
pub trait UpdateSink: Send + Sync {
    /// Request a push.
    fn config_update(&self, req: PushRequest);
}

/// An [`UpdateSink`] that can be handed out before the push engine exists
/// and bound to it later. Breaks the construction cycle between the engine
/// and the subsystems that feed it.
#[derive(Clone, Default)]
pub struct LazySink {
    inner: Arc<OnceLock<Arc<dyn UpdateSink>>>,
}

impl LazySink {
    /// Create an unbound sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the real sink. Later binds are ignored.
    pub fn bind(&self, sink: Arc<dyn UpdateSink>) {
        let _ = self.inner.set(sink);
    }
}

impl UpdateSink for LazySink {
    fn config_update(&self, req: PushRequest) {
        match self.inner.get() {
            Some(sink) => sink.config_update(req),
            None => debug!("push requested before the engine was bound, dropped"),
        }
    }
}

/// Everything the push engine reads when building a snapshot.
///
/// Mesh and networks are hot-swapped snapshots; readers take the pointer once
/// per operation and never observe a partial update.
#[derive(Clone)]
pub struct Environment {
    mesh: watch::Receiver<Arc<MeshConfig>>,
    networks: watch::Receiver<Arc<MeshNetworks>>,
    /// Aggregated configuration cache.
    pub config: Arc<dyn ConfigStoreCache>,
    /// Aggregated service registries.
    pub services: Arc<ServiceAggregate>,
}

impl Environment {
    /// Assemble the environment.
    pub fn new(
        mesh: watch::Receiver<Arc<MeshConfig>>,
        networks: watch::Receiver<Arc<MeshNetworks>>,
        config: Arc<dyn ConfigStoreCache>,
        services: Arc<ServiceAggregate>,
    ) -> Self {
        Self {
            mesh,
            networks,
            config,
            services,
        }
    }

    /// Current mesh configuration snapshot.
    pub fn mesh(&self) -> Arc<MeshConfig> {
        self.mesh.borrow().clone()
    }

    /// Current network topology snapshot.
    pub fn networks(&self) -> Arc<MeshNetworks> {
        self.networks.borrow().clone()
    }

    /// Whether both the config cache and every service registry have
    /// observed their initial snapshots.
    pub fn has_synced(&self) -> bool {
        self.config.has_synced() && self.services.has_synced()
    }
}

/// A single coherent push, broadcast to all connected streams.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Monotonic push version.
    pub version: u64,
    /// Whether the snapshot was fully recomputed.
    pub full: bool,
    /// Changed type names; empty means everything.
    pub types: BTreeSet<String>,
}

/// The push engine.
pub struct DiscoveryServer {
    env: Environment,
    push_tx: mpsc::UnboundedSender<PushRequest>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<PushRequest>>>,
    events: broadcast::Sender<Arc<PushEvent>>,
    version: AtomicU64,
    plugins: Vec<String>,
}

impl DiscoveryServer {
    /// Create the engine over the given environment. `plugins` is carried
    /// for snapshot generation and surfaced on the debug endpoints.
    pub fn new(env: Environment, plugins: Vec<String>) -> Arc<Self> {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            env,
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            events,
            version: AtomicU64::new(0),
            plugins,
        })
    }

    /// The environment this engine reads from.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Enabled plugin names.
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Subscribe to pushes.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.events.subscribe()
    }

    /// Version of the most recent push.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of pushes emitted so far.
    pub fn push_count(&self) -> u64 {
        self.version()
    }

    fn flush(&self, req: PushRequest) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let event = PushEvent {
            version,
            full: req.full,
            types: req.types_updated,
        };
        debug!(version, full = event.full, "pushing discovery snapshot");
        // Send fails only when no stream is connected, which is fine.
        let _ = self.events.send(Arc::new(event));
    }

    /// Debounce loop: coalesces bursts of requests into single pushes.
    /// Runs until shutdown.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        let mut rx = self
            .push_rx
            .lock()
            .expect("push lock poisoned")
            .take()
            .expect("push loop started twice");

        let mut pending: Option<(PushRequest, Instant, Instant)> = None;
        loop {
            let deadline = pending
                .as_ref()
                .map(|(_, first, last)| (*last + DEBOUNCE_AFTER).min(*first + DEBOUNCE_MAX));
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = stop.recv() => break,
                _ = timer => {
                    if let Some((req, _, _)) = pending.take() {
                        self.flush(req);
                    }
                }
                msg = rx.recv() => match msg {
                    Some(req) => {
                        let now = Instant::now();
                        match &mut pending {
                            Some((merged, _, last)) => {
                                merged.merge(req);
                                *last = now;
                            }
                            None => pending = Some((req, now, now)),
                        }
                    }
                    None => break,
                }
            }
        }
        info!("discovery push loop stopped");
    }
}

impl UpdateSink for DiscoveryServer {
    fn config_update(&self, req: PushRequest) {
        let _ = self.push_tx.send(req);
    }
}

/// The aggregated discovery gRPC service: one bidirectional stream per
/// data-plane client, all resource types multiplexed.
pub struct AdsService {
    discovery: Arc<DiscoveryServer>,
}

impl AdsService {
    /// Create the service over the push engine.
    pub fn new(discovery: Arc<DiscoveryServer>) -> Self {
        Self { discovery }
    }

    /// Convert to a tonic service.
    pub fn into_service(self) -> AggregatedDiscoveryServer<Self> {
        AggregatedDiscoveryServer::new(self)
    }
}

fn snapshot_response(env: &Environment, type_url: &str, version: u64) -> DiscoveryResponse {
    let resources: Vec<Resource> = if type_url == TYPE_SERVICES {
        env.services
            .services()
            .unwrap_or_default()
            .into_iter()
            .map(|svc| Resource {
                collection: TYPE_SERVICES.to_string(),
                name: svc.hostname.clone(),
                namespace: String::new(),
                version: version.to_string(),
                body: serde_json::to_vec(&svc).unwrap_or_default(),
            })
            .collect()
    } else {
        env.config
            .list(type_url, None)
            .into_iter()
            .map(|entry| Resource {
                collection: entry.kind.clone(),
                name: entry.name.clone(),
                namespace: entry.namespace.clone(),
                version: entry.resource_version.clone(),
                body: serde_json::to_vec(&entry.spec).unwrap_or_default(),
            })
            .collect()
    };

    DiscoveryResponse {
        type_url: type_url.to_string(),
        version_info: version.to_string(),
        nonce: format!("{type_url}/{version}"),
        resources,
    }
}

#[tonic::async_trait]
impl AggregatedDiscovery for AdsService {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let mut inbound = request.into_inner();
        let discovery = self.discovery.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut events = discovery.subscribe();
            let mut watched: BTreeSet<String> = BTreeSet::new();
            loop {
                tokio::select! {
                    msg = inbound.message() => match msg {
                        Ok(Some(req)) => {
                            if watched.insert(req.type_url.clone()) {
                                debug!(node = %req.node_id, type_url = %req.type_url, "stream subscribed");
                                let resp = snapshot_response(
                                    discovery.environment(),
                                    &req.type_url,
                                    discovery.version(),
                                );
                                if tx.send(Ok(resp)).await.is_err() {
                                    break;
                                }
                            }
                            // Later messages with a nonce are acks; nothing to do.
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "discovery stream closed");
                            break;
                        }
                    },
                    event = events.recv() => match event {
                        Ok(event) => {
                            for type_url in &watched {
                                if !event.full
                                    && !event.types.is_empty()
                                    && !event.types.contains(type_url)
                                {
                                    continue;
                                }
                                let resp = snapshot_response(
                                    discovery.environment(),
                                    type_url,
                                    event.version,
                                );
                                if tx.send(Ok(resp)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "discovery stream lagged behind pushes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryController;
    use crate::registry::aggregate::ServiceAggregate;

    fn environment() -> (
        watch::Sender<Arc<MeshConfig>>,
        watch::Sender<Arc<MeshNetworks>>,
        Environment,
    ) {
        let (mesh_tx, mesh_rx) = watch::channel(Arc::new(MeshConfig::default()));
        let (networks_tx, networks_rx) = watch::channel(Arc::new(MeshNetworks::default()));
        let config = Arc::new(MemoryController::new());
        let services = Arc::new(ServiceAggregate::new());
        let env = Environment::new(mesh_rx, networks_rx, config, services);
        (mesh_tx, networks_tx, env)
    }

    #[test]
    fn push_request_merge_unions_types() {
        let mut a = PushRequest::for_types(["routes"]);
        a.merge(PushRequest::for_types(["gateways"]));
        a.merge(PushRequest::full());
        assert!(a.full);
        assert_eq!(a.types_updated.len(), 2);
    }

    #[test]
    fn environment_swaps_mesh_snapshot() {
        let (mesh_tx, _networks_tx, env) = environment();
        assert_eq!(env.mesh().check_server, "");

        let mut updated = MeshConfig::default();
        updated.check_server = "m2:9091".to_string();
        mesh_tx.send(Arc::new(updated)).unwrap();

        assert_eq!(env.mesh().check_server, "m2:9091");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_collapses_to_one_push() {
        let (_m, _n, env) = environment();
        let discovery = DiscoveryServer::new(env, vec![]);
        let mut events = discovery.subscribe();

        let shutdown = crate::lifecycle::Shutdown::new();
        let loop_discovery = discovery.clone();
        let stop = shutdown.subscribe();
        let handle = tokio::spawn(async move { loop_discovery.run(stop).await });

        for _ in 0..10 {
            discovery.config_update(PushRequest::for_types(["routes"]));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let event = events.try_recv().expect("one push expected");
        assert_eq!(event.version, 1);
        assert!(event.types.contains("routes"));
        assert!(events.try_recv().is_err(), "burst must collapse to one push");

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_updates_bounded_by_max_debounce() {
        let (_m, _n, env) = environment();
        let discovery = DiscoveryServer::new(env, vec![]);
        let mut events = discovery.subscribe();

        let shutdown = crate::lifecycle::Shutdown::new();
        let loop_discovery = discovery.clone();
        let stop = shutdown.subscribe();
        let handle = tokio::spawn(async move { loop_discovery.run(stop).await });

        // Keep updating every 50ms, under the quiet period, for 1.5s: the
        // max bound must force at least one push through.
        for _ in 0..30 {
            discovery.config_update(PushRequest::full());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(events.try_recv().is_ok());

        shutdown.trigger();
        handle.await.unwrap();
    }
}
