//! Discovery server bootstrap and lifecycle
//!
//! [`Server::new`] composes the subsystems in dependency order: cluster
//! client, mesh configuration, network topology, config controller, service
//! registries, discovery wiring, monitoring, multicluster coordination, and
//! certificate provisioning. Construction may fail; it binds listeners and
//! queues deferred start actions but serves nothing.
//!
//! [`Server::start`] walks the queued actions in registration order. Each
//! action spawns its background work against the shared [`Shutdown`]
//! coordinator and returns immediately; the first failing action aborts
//! startup. Stopping is the coordinator's trigger, and every component is
//! responsible for its own bounded-time exit.

pub mod args;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info, warn};

use crate::config::aggregate::AggregateCache;
use crate::config::kube::KubeConfigStore;
use crate::config::memory::MemoryController;
use crate::config::monitor::FileMonitor;
use crate::config::remote::{
    self, RemoteSource, RemoteSourceOptions, SourceCredentials,
};
use crate::config::ConfigStoreCache;
use crate::discovery::admin::{admin_router, monitor_router};
use crate::discovery::mux::{server_tls_config, SecureMux};
use crate::discovery::{AdsService, DiscoveryServer, Environment, LazySink, PushRequest, UpdateSink};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::mesh::{self, IngressMode, MeshConfig, MeshNetworks};
use crate::multicluster::Multicluster;
use crate::registry::aggregate::ServiceAggregate;
use crate::registry::consul::ConsulRegistry;
use crate::registry::kube::KubeRegistry;
use crate::registry::memory::MemoryRegistry;
use crate::registry::service_entries::ServiceEntryStore;
use crate::registry::{provider, Registry, RegistryController};
use crate::security::{CertController, CertificateAuthority, RotationEntry};
use crate::server::args::ServerArgs;
use crate::watcher::FileWatcher;
use crate::{Error, Result};

/// Deadline for HTTP servers to finish in-flight requests at shutdown.
pub const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for caches to sync.
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

type StartAction = Box<dyn FnOnce(&Shutdown) -> Result<()> + Send>;

/// Late-bound handles for the network-topology reload callback: both targets
/// are created after the loaders that need to reach them.
#[derive(Default)]
struct NetworkRebind {
    kube: OnceLock<Arc<KubeRegistry>>,
    multicluster: OnceLock<Arc<Multicluster>>,
}

/// The composed control plane.
pub struct Server {
    http_addr: SocketAddr,
    grpc_addr: SocketAddr,
    secure_grpc_addr: Option<SocketAddr>,
    monitor_addr: SocketAddr,

    mesh_tx: Arc<watch::Sender<Arc<MeshConfig>>>,
    networks_tx: Arc<watch::Sender<Arc<MeshNetworks>>>,
    environment: Environment,
    discovery: Arc<DiscoveryServer>,
    multicluster: Option<Arc<Multicluster>>,

    // Keeps watch registrations alive for the life of the server.
    _file_watcher: Arc<FileWatcher>,

    start_actions: Vec<StartAction>,
}

impl Server {
    /// Compose a server from arguments. Initialization order is fixed and
    /// any failure aborts construction.
    pub async fn new(mut args: ServerArgs) -> Result<Server> {
        if args.namespace.is_empty() {
            args.namespace = std::env::var(crate::POD_NAMESPACE_ENV)
                .unwrap_or_else(|_| crate::DEFAULT_NAMESPACE.to_string());
        }
        if args.config.cluster_registries_namespace.is_empty() {
            args.config.cluster_registries_namespace = args.namespace.clone();
        }

        let file_watcher = Arc::new(FileWatcher::new()?);
        let sink = LazySink::new();
        let rebind = Arc::new(NetworkRebind::default());
        let mut actions: Vec<StartAction> = Vec::new();

        let kube_client = Self::init_kube_client(&args).await?;

        let (mesh_tx, mesh_rx) =
            Self::init_mesh(&args, kube_client.as_ref(), &file_watcher, &sink).await?;
        let (networks_tx, networks_rx) =
            Self::init_mesh_networks(&args, &file_watcher, &sink, &rebind)?;

        let config_controller = Self::init_config_controller(
            &args,
            kube_client.as_ref(),
            &mesh_rx.borrow().clone(),
            &sink,
            &mut actions,
        )?;

        let service_controller = Self::init_service_controllers(
            &args,
            kube_client.as_ref(),
            &networks_rx.borrow().clone(),
            &config_controller,
            &rebind,
            &mut actions,
        )?;

        let environment = Environment::new(
            mesh_rx.clone(),
            networks_rx.clone(),
            config_controller.clone(),
            service_controller.clone(),
        );
        let discovery = DiscoveryServer::new(environment.clone(), args.plugins.clone());
        sink.bind(discovery.clone());

        // Every config and service change funnels into the push engine.
        let push_sink = sink.clone();
        config_controller.register_event_handler(Arc::new(move |entry, _| {
            push_sink.config_update(PushRequest::for_types([entry.kind.clone()]));
        }));
        let push_sink = sink.clone();
        service_controller.append_service_handler(Arc::new(move |_, _| {
            push_sink.config_update(PushRequest::full());
        }));

        {
            let discovery = discovery.clone();
            actions.push(Box::new(move |shutdown| {
                let stop = shutdown.subscribe();
                tokio::spawn(async move { discovery.run(stop).await });
                Ok(())
            }));
        }

        let (http_addr, grpc_addr, secure_grpc_addr) = Self::init_discovery_listeners(
            &args,
            &environment,
            &discovery,
            &mut actions,
        )
        .await?;
        let monitor_addr = Self::init_monitor(&args, &mut actions).await?;

        let multicluster = Self::init_cluster_registries(
            &args,
            kube_client.as_ref(),
            &service_controller,
            &sink,
            networks_rx.clone(),
            &rebind,
            &mut actions,
        );

        Self::init_cert_controller(
            &args,
            kube_client.as_ref(),
            &mesh_rx.borrow().clone(),
            &mut actions,
        )?;

        Ok(Server {
            http_addr,
            grpc_addr,
            secure_grpc_addr,
            monitor_addr,
            mesh_tx,
            networks_tx,
            environment,
            discovery,
            multicluster,
            _file_watcher: file_watcher,
            start_actions: actions,
        })
    }

    /// Run every deferred start action in registration order. The first
    /// error aborts startup. Serving begins asynchronously once caches sync;
    /// cancellation is the coordinator's trigger.
    pub fn start(&mut self, shutdown: &Shutdown) -> Result<()> {
        for action in self.start_actions.drain(..) {
            action(shutdown)?;
        }
        Ok(())
    }

    /// Bound admin HTTP address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound discovery gRPC address.
    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    /// Bound secure discovery address, when enabled.
    pub fn secure_grpc_addr(&self) -> Option<SocketAddr> {
        self.secure_grpc_addr
    }

    /// Bound monitoring address.
    pub fn monitor_addr(&self) -> SocketAddr {
        self.monitor_addr
    }

    /// The push engine.
    pub fn discovery(&self) -> Arc<DiscoveryServer> {
        self.discovery.clone()
    }

    /// The shared environment.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// The multicluster coordinator, when a cluster registry is enabled.
    pub fn multicluster(&self) -> Option<Arc<Multicluster>> {
        self.multicluster.clone()
    }

    /// Current mesh snapshot.
    pub fn mesh(&self) -> Arc<MeshConfig> {
        self.mesh_tx.borrow().clone()
    }

    /// Current network topology snapshot.
    pub fn networks(&self) -> Arc<MeshNetworks> {
        self.networks_tx.borrow().clone()
    }

    async fn init_kube_client(args: &ServerArgs) -> Result<Option<kube::Client>> {
        if has_kube_registry(args) && args.config.file_dir.is_none() {
            let client = kube::Client::try_default()
                .await
                .map_err(|e| Error::registry(format!("failed to connect to the cluster API: {e}")))?;
            return Ok(Some(client));
        }
        Ok(None)
    }

    /// Load the initial mesh configuration and arm the hot-reload watcher.
    async fn init_mesh(
        args: &ServerArgs,
        kube_client: Option<&kube::Client>,
        file_watcher: &Arc<FileWatcher>,
        sink: &LazySink,
    ) -> Result<(Arc<watch::Sender<Arc<MeshConfig>>>, watch::Receiver<Arc<MeshConfig>>)> {
        let mut loaded_from_file = false;
        let mut mesh_config = None;

        if args.mesh_config.is_some() {
            mesh_config = args.mesh_config.clone();
        } else if let Some(path) = &args.mesh.config_file {
            match mesh::read_mesh_config(path) {
                Ok(m) => {
                    loaded_from_file = true;
                    mesh_config = Some(m);
                }
                Err(e) => warn!(error = %e, "failed to read mesh configuration, using default"),
            }
        }

        let mesh_config = match mesh_config {
            Some(m) => m,
            None => {
                let mut m = match kube_client {
                    Some(client) => {
                        mesh::from_config_map(client, &args.namespace, mesh::CONFIG_MAP_NAME)
                            .await
                            .map_err(|e| Error::mesh(format!("failed to read the default mesh configuration: {e}")))?
                    }
                    None => MeshConfig::default(),
                };
                if let Some(addr) = &args.mesh.telemetry_address {
                    m.check_server = addr.clone();
                    m.report_server = addr.clone();
                }
                m
            }
        };

        info!(sources = mesh_config.config_sources.len(), "mesh configuration loaded");
        let (tx, rx) = watch::channel(Arc::new(mesh_config));
        let tx = Arc::new(tx);

        if loaded_from_file {
            let path = args.mesh.config_file.clone().expect("checked above");
            let mesh_tx = tx.clone();
            let sink = sink.clone();
            file_watcher.add(&path.clone(), move || {
                let new_mesh = match mesh::read_mesh_config(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "failed to re-read mesh configuration, keeping current");
                        return;
                    }
                };
                let current = mesh_tx.borrow().clone();
                if *current == new_mesh {
                    return;
                }
                info!("mesh configuration updated");
                if current.config_sources != new_mesh.config_sources {
                    // Config sources are wired at construction; a change
                    // here takes effect on the next restart.
                    info!("mesh configuration sources have changed");
                }
                let _ = mesh_tx.send(Arc::new(new_mesh));
                sink.config_update(PushRequest::full());
            })?;
        }

        Ok((tx, rx))
    }

    /// Load the network topology and arm its hot-reload watcher.
    fn init_mesh_networks(
        args: &ServerArgs,
        file_watcher: &Arc<FileWatcher>,
        sink: &LazySink,
        rebind: &Arc<NetworkRebind>,
    ) -> Result<(Arc<watch::Sender<Arc<MeshNetworks>>>, watch::Receiver<Arc<MeshNetworks>>)> {
        let Some(path) = args.networks_config_file.clone() else {
            info!("mesh networks configuration not provided");
            let (tx, rx) = watch::channel(Arc::new(MeshNetworks::default()));
            return Ok((Arc::new(tx), rx));
        };

        let networks = match mesh::read_mesh_networks(&path) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to read mesh networks configuration, using default");
                MeshNetworks::default()
            }
        };
        info!(networks = networks.networks.len(), "mesh networks configuration loaded");

        let (tx, rx) = watch::channel(Arc::new(networks));
        let tx = Arc::new(tx);

        let networks_tx = tx.clone();
        let sink = sink.clone();
        let rebind = rebind.clone();
        file_watcher.add(&path, move || {
            let new_networks = match mesh::read_mesh_networks(&path) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "failed to re-read mesh networks configuration, keeping current");
                    return;
                }
            };
            let current = networks_tx.borrow().clone();
            if *current == new_networks {
                return;
            }
            info!("mesh networks configuration updated");
            let _ = networks_tx.send(Arc::new(new_networks.clone()));
            if let Some(kube) = rebind.kube.get() {
                kube.init_network_lookup(&new_networks);
            }
            if let Some(multicluster) = rebind.multicluster.get() {
                multicluster.reload_network_lookup(&new_networks);
            }
            sink.config_update(PushRequest::full());
        })?;

        Ok((tx, rx))
    }

    /// Compose the config controller. Precedence: explicit config sources,
    /// caller-supplied controller, local directory, cluster store. Ingress
    /// mode layers one more child over the result.
    fn init_config_controller(
        args: &ServerArgs,
        kube_client: Option<&kube::Client>,
        mesh_config: &MeshConfig,
        sink: &LazySink,
        actions: &mut Vec<StartAction>,
    ) -> Result<Arc<dyn ConfigStoreCache>> {
        let controller: Arc<dyn ConfigStoreCache> = if !mesh_config.config_sources.is_empty() {
            Self::init_sourced_config_controller(args, mesh_config, sink, actions)?
        } else if let Some(controller) = args.config.controller.clone() {
            controller
        } else if let Some(dir) = args.config.file_dir.clone() {
            let controller = Arc::new(MemoryController::new());
            Self::add_file_monitor(dir, controller.clone(), actions);
            controller
        } else {
            let client = kube_client.cloned().ok_or_else(|| {
                Error::config("no config source, directory, controller, or cluster client available")
            })?;
            KubeConfigStore::new(client, args.namespace.clone())
        };

        // Ingress mode layers ingress-derived objects over the composition.
        let controller: Arc<dyn ConfigStoreCache> = match (kube_client, mesh_config.ingress_controller_mode) {
            (Some(client), mode) if mode != IngressMode::Off => {
                let ingress = crate::config::ingress::IngressConfigStore::new(client.clone(), mode);
                Arc::new(AggregateCache::make(vec![controller, ingress])?)
            }
            _ => controller,
        };

        {
            let controller = controller.clone();
            actions.push(Box::new(move |shutdown| {
                let stop = shutdown.subscribe();
                tokio::spawn(async move { controller.run(stop).await });
                Ok(())
            }));
        }

        Ok(controller)
    }

    /// One child cache per configured source: a file monitor for `fs://`
    /// addresses, a streaming client for everything else.
    fn init_sourced_config_controller(
        args: &ServerArgs,
        mesh_config: &MeshConfig,
        sink: &LazySink,
        actions: &mut Vec<StartAction>,
    ) -> Result<Arc<dyn ConfigStoreCache>> {
        let opts = RemoteSourceOptions {
            max_message_size: args.max_message_size,
            initial_window_size: args.initial_window_size,
            initial_conn_window_size: args.initial_conn_window_size,
            keepalive_interval: args.keepalive.interval,
            keepalive_timeout: args.keepalive.timeout,
        };
        let cert_dir = crate::cert_dir();

        let mut children: Vec<Arc<dyn ConfigStoreCache>> = Vec::new();
        let mut sources: Vec<Arc<RemoteSource>> = Vec::new();

        for source in &mesh_config.config_sources {
            if let Some(path) = source.fs_path() {
                if path.is_empty() {
                    return Err(Error::config(format!(
                        "invalid fs config source {:?}: contains no path",
                        source.address
                    )));
                }
                let controller = Arc::new(MemoryController::new());
                Self::add_file_monitor(PathBuf::from(path), controller.clone(), actions);
                children.push(controller);
                continue;
            }

            let credentials = SourceCredentials::from_settings(source.tls.as_ref(), &cert_dir)?;
            let channel = remote::connect(&source.address, &credentials, &opts)?;
            let controller = Arc::new(MemoryController::new());
            children.push(controller.clone());
            sources.push(Arc::new(RemoteSource::new(
                source.address.clone(),
                channel,
                controller,
                Arc::new(sink.clone()),
                crate::config::collections::all()
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                format!("trellis/{}", args.namespace),
                args.max_message_size,
            )));
        }

        if !sources.is_empty() {
            let credential_waits: Vec<Vec<PathBuf>> = mesh_config
                .config_sources
                .iter()
                .filter(|s| s.fs_path().is_none())
                .map(|s| {
                    SourceCredentials::from_settings(s.tls.as_ref(), &cert_dir)
                        .map(|c| c.required_files())
                })
                .collect::<Result<_>>()?;

            actions.push(Box::new(move |shutdown| {
                // Sources stop on their own coordinator so the reader tasks
                // can be joined before the connections drop.
                let source_shutdown = Shutdown::new();
                let mut handles = Vec::new();
                for (source, required) in sources.into_iter().zip(credential_waits) {
                    let stop = source_shutdown.subscribe();
                    handles.push(tokio::spawn(async move {
                        if remote::wait_for_credential_files(&required, stop.clone())
                            .await
                            .is_err()
                        {
                            return;
                        }
                        source.run(stop).await;
                    }));
                }
                let mut main_stop = shutdown.subscribe();
                tokio::spawn(async move {
                    main_stop.recv().await;
                    source_shutdown.trigger();
                    for handle in handles {
                        let _ = handle.await;
                    }
                    info!("remote config sources closed");
                });
                Ok(())
            }));
        }

        Ok(Arc::new(AggregateCache::make(children)?))
    }

    fn add_file_monitor(
        dir: PathBuf,
        controller: Arc<MemoryController>,
        actions: &mut Vec<StartAction>,
    ) {
        actions.push(Box::new(move |shutdown| {
            let stop = shutdown.subscribe();
            let monitor = FileMonitor::new(dir, controller);
            tokio::spawn(async move { monitor.run(stop).await });
            Ok(())
        }));
    }

    /// Select registry adapters by name, rejecting duplicates, and add the
    /// always-present service-entries registry.
    fn init_service_controllers(
        args: &ServerArgs,
        kube_client: Option<&kube::Client>,
        networks: &MeshNetworks,
        config_controller: &Arc<dyn ConfigStoreCache>,
        rebind: &Arc<NetworkRebind>,
        actions: &mut Vec<StartAction>,
    ) -> Result<Arc<ServiceAggregate>> {
        let aggregate = Arc::new(ServiceAggregate::new());
        let mut registered: HashSet<&str> = HashSet::new();

        for name in &args.service.registries {
            if !registered.insert(name.as_str()) {
                warn!(registry = %name, "registry specified multiple times, ignoring duplicate");
                continue;
            }
            info!(registry = %name, "adding registry adapter");
            match name.as_str() {
                provider::MOCK => {
                    let registry = Arc::new(MemoryRegistry::new());
                    aggregate.add_registry(Registry {
                        name: provider::MOCK.to_string(),
                        cluster_id: "mock".to_string(),
                        discovery: registry.clone(),
                        controller: registry,
                    });
                }
                provider::KUBERNETES => {
                    let client = kube_client.cloned().ok_or_else(|| {
                        Error::registry("kubernetes registry requires a cluster client")
                    })?;
                    let registry = KubeRegistry::new(
                        client,
                        provider::KUBERNETES,
                        args.config.controller_options.domain_suffix.clone(),
                    );
                    registry.init_network_lookup(networks);
                    let _ = rebind.kube.set(registry.clone());
                    aggregate.add_registry(Registry {
                        name: provider::KUBERNETES.to_string(),
                        cluster_id: provider::KUBERNETES.to_string(),
                        discovery: registry.clone(),
                        controller: registry,
                    });
                }
                provider::CONSUL => {
                    let registry = ConsulRegistry::new(
                        args.service.consul.server_url.clone(),
                        args.service.consul.interval,
                    )?;
                    aggregate.add_registry(Registry {
                        name: provider::CONSUL.to_string(),
                        cluster_id: provider::CONSUL.to_string(),
                        discovery: registry.clone(),
                        controller: registry,
                    });
                }
                provider::MCP => {
                    info!("mcp registry: services are served from config service entries");
                }
                unknown => {
                    return Err(Error::registry(format!(
                        "service registry {unknown} is not supported"
                    )));
                }
            }
        }

        // Service entries always participate.
        let entry_store = ServiceEntryStore::new(config_controller.clone());
        aggregate.add_registry(Registry {
            name: provider::SERVICE_ENTRIES.to_string(),
            cluster_id: provider::SERVICE_ENTRIES.to_string(),
            discovery: entry_store.clone(),
            controller: entry_store,
        });

        {
            let aggregate = aggregate.clone();
            actions.push(Box::new(move |shutdown| {
                let stop = shutdown.subscribe();
                tokio::spawn(async move { aggregate.run(stop).await });
                Ok(())
            }));
        }

        Ok(aggregate)
    }

    /// Bind the discovery listeners and queue their serve actions. Serving
    /// waits for cache sync before accepting work.
    async fn init_discovery_listeners(
        args: &ServerArgs,
        environment: &Environment,
        discovery: &Arc<DiscoveryServer>,
        actions: &mut Vec<StartAction>,
    ) -> Result<(SocketAddr, SocketAddr, Option<SocketAddr>)> {
        let http_listener = TcpListener::bind(&args.discovery.http_addr).await?;
        let http_addr = http_listener.local_addr()?;

        let grpc_listener = TcpListener::bind(&args.discovery.grpc_addr).await?;
        let grpc_addr = grpc_listener.local_addr()?;

        // Plain HTTP admin listener.
        {
            let env = environment.clone();
            let router = admin_router(discovery.clone());
            actions.push(Box::new(move |shutdown| {
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    if !wait_for_cache_sync(&env, &mut stop).await {
                        return;
                    }
                    info!(addr = %http_addr, "discovery service serving http");
                    serve_http(http_listener, router, stop).await;
                });
                Ok(())
            }));
        }

        // Plain gRPC discovery listener.
        {
            let env = environment.clone();
            let service = AdsService::new(discovery.clone()).into_service();
            let keepalive = args.keepalive.clone();
            let force_stop = args.force_stop;
            actions.push(Box::new(move |shutdown| {
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    if !wait_for_cache_sync(&env, &mut stop).await {
                        return;
                    }
                    info!(addr = %grpc_addr, "discovery service serving grpc");
                    let builder = tonic::transport::Server::builder()
                        .http2_keepalive_interval(Some(keepalive.interval))
                        .http2_keepalive_timeout(Some(keepalive.timeout))
                        .add_service(service);
                    let incoming = TcpListenerStream::new(grpc_listener);
                    if force_stop {
                        tokio::select! {
                            result = builder.serve_with_incoming(incoming) => {
                                if let Err(e) = result {
                                    warn!(error = %e, "grpc server exited");
                                }
                            }
                            _ = stop.recv() => info!("grpc server stopped"),
                        }
                    } else {
                        let result = builder
                            .serve_with_incoming_shutdown(incoming, async move {
                                stop.recv().await;
                            })
                            .await;
                        match result {
                            Ok(()) => info!("grpc server drained"),
                            Err(e) => warn!(error = %e, "grpc server exited"),
                        }
                    }
                });
                Ok(())
            }));
        }

        // Optional secure listener: mutual TLS, gRPC and HTTP multiplexed.
        let mut secure_addr = None;
        if !args.discovery.secure_grpc_addr.is_empty() {
            let listener = std::net::TcpListener::bind(&args.discovery.secure_grpc_addr)?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            secure_addr = Some(addr);

            // Certs must already be present; a missing trio is an
            // initialization error, not a serve-time surprise.
            let tls = server_tls_config(&crate::cert_dir())?;
            let rustls_config = RustlsConfig::from_config(Arc::new(tls));

            let env = environment.clone();
            let grpc_routes = tonic::service::Routes::new(
                AdsService::new(discovery.clone()).into_service(),
            )
            .into_axum_router();
            let router = SecureMux::new(admin_router(discovery.clone()), grpc_routes).into_router();

            actions.push(Box::new(move |shutdown| {
                let mut stop = shutdown.subscribe();
                let stop_flag = stop.clone();
                tokio::spawn(async move {
                    if !wait_for_cache_sync(&env, &mut stop).await {
                        return;
                    }
                    info!(addr = %addr, "discovery service serving secure grpc");

                    let handle = axum_server::Handle::new();
                    let shutdown_handle = handle.clone();
                    let mut shutdown_stop = stop.clone();
                    tokio::spawn(async move {
                        shutdown_stop.recv().await;
                        shutdown_handle.graceful_shutdown(Some(HTTP_SHUTDOWN_TIMEOUT));
                    });

                    let result = axum_server::from_tcp_rustls(listener, rustls_config)
                        .handle(handle)
                        .serve(router.into_make_service())
                        .await;
                    match result {
                        Err(e) if !stop_flag.is_triggered() => {
                            panic!("stopped listening on {addr} due to error: {e}");
                        }
                        _ => info!(addr = %addr, "stopped listening"),
                    }
                });
                Ok(())
            }));
        }

        Ok((http_addr, grpc_addr, secure_addr))
    }

    /// Bind the monitoring listener; it serves immediately, without waiting
    /// for cache sync, so liveness stays observable during startup.
    async fn init_monitor(args: &ServerArgs, actions: &mut Vec<StartAction>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&args.discovery.monitoring_addr).await?;
        let addr = listener.local_addr()?;
        actions.push(Box::new(move |shutdown| {
            let stop = shutdown.subscribe();
            tokio::spawn(async move {
                serve_http(listener, monitor_router(), stop).await;
            });
            Ok(())
        }));
        Ok(addr)
    }

    /// Start the multicluster coordinator when a cluster registry is active.
    fn init_cluster_registries(
        args: &ServerArgs,
        kube_client: Option<&kube::Client>,
        aggregate: &Arc<ServiceAggregate>,
        sink: &LazySink,
        networks: watch::Receiver<Arc<MeshNetworks>>,
        rebind: &Arc<NetworkRebind>,
        actions: &mut Vec<StartAction>,
    ) -> Option<Arc<Multicluster>> {
        if !has_kube_registry(args) {
            return None;
        }
        let client = kube_client?.clone();
        let multicluster = Multicluster::new(
            client,
            args.config.cluster_registries_namespace.clone(),
            args.config.controller_options.domain_suffix.clone(),
            aggregate.clone(),
            Arc::new(sink.clone()),
            networks,
        );
        let _ = rebind.multicluster.set(multicluster.clone());

        {
            let multicluster = multicluster.clone();
            actions.push(Box::new(move |shutdown| {
                let stop = shutdown.subscribe();
                tokio::spawn(async move { multicluster.run(stop).await });
                Ok(())
            }));
        }
        Some(multicluster)
    }

    /// Provision certificates: entries with a secret name join the rotation
    /// loop; the first entry without one becomes this process's own pair.
    fn init_cert_controller(
        args: &ServerArgs,
        kube_client: Option<&kube::Client>,
        mesh_config: &MeshConfig,
        actions: &mut Vec<StartAction>,
    ) -> Result<()> {
        if mesh_config.certificates.is_empty() {
            info!("no certificates configured");
            return Ok(());
        }

        let ca = Arc::new(CertificateAuthority::new("trellis-ca")?);
        let mut rotation = Vec::new();
        let mut own_cert_written = false;

        for entry in &mesh_config.certificates {
            if entry.dns_names.is_empty() {
                continue;
            }
            if let Some(secret_name) = &entry.secret_name {
                rotation.push(RotationEntry {
                    secret_name: secret_name.clone(),
                    namespace: args.namespace.clone(),
                    dns_names: entry.dns_names.clone(),
                });
            } else if !own_cert_written {
                // Only one entry may claim the local key-cert directory.
                let issued = ca.issue_server_cert(&entry.dns_names)?;
                crate::security::write_key_cert_dir(
                    &crate::key_cert_dir(),
                    &issued,
                    ca.ca_cert_pem(),
                )?;
                own_cert_written = true;
            }
        }

        if !rotation.is_empty() {
            let Some(client) = kube_client.cloned() else {
                warn!("certificate secrets configured without a cluster client, skipping rotation");
                return Ok(());
            };
            let controller = CertController::new(ca, client, rotation);
            actions.push(Box::new(move |shutdown| {
                let stop = shutdown.subscribe();
                tokio::spawn(async move { controller.run(stop).await });
                Ok(())
            }));
        }
        Ok(())
    }
}

fn has_kube_registry(args: &ServerArgs) -> bool {
    args.service
        .registries
        .iter()
        .any(|r| r == provider::KUBERNETES)
}

/// Block until the config cache and every service registry report synced.
/// Returns false if shutdown arrives first.
async fn wait_for_cache_sync(env: &Environment, stop: &mut ShutdownSignal) -> bool {
    loop {
        if env.has_synced() {
            return true;
        }
        tokio::select! {
            _ = stop.recv() => {
                error!("failed waiting for cache sync");
                return false;
            }
            _ = tokio::time::sleep(CACHE_SYNC_POLL_INTERVAL) => {}
        }
    }
}

/// Serve an axum router until shutdown, allowing in-flight requests
/// [`HTTP_SHUTDOWN_TIMEOUT`] to finish.
async fn serve_http(listener: TcpListener, router: axum::Router, stop: ShutdownSignal) {
    use std::future::IntoFuture;

    let mut graceful_stop = stop.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { graceful_stop.recv().await })
        .into_future();
    tokio::pin!(server);

    let mut deadline_stop = stop;
    tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                warn!(error = %e, "http server exited");
            }
        }
        _ = async {
            deadline_stop.recv().await;
            tokio::time::sleep(HTTP_SHUTDOWN_TIMEOUT).await;
        } => {
            warn!("http server shutdown deadline exceeded, abandoning connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    fn base_args(dir: &Path) -> ServerArgs {
        let mut args = ServerArgs::new();
        args.discovery.http_addr = "127.0.0.1:0".to_string();
        args.discovery.grpc_addr = "127.0.0.1:0".to_string();
        args.discovery.monitoring_addr = "127.0.0.1:0".to_string();
        args.namespace = "trellis-test".to_string();
        args.config.file_dir = Some(dir.join("config"));
        args.service.registries = vec![provider::MOCK.to_string()];
        args
    }

    fn prepare_dirs(dir: &Path) {
        std::fs::create_dir_all(dir.join("config")).unwrap();
    }

    #[tokio::test]
    async fn unknown_registry_aborts_construction() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());
        let mut args = base_args(dir.path());
        args.service.registries = vec!["Zookeeper".to_string()];

        let err = Server::new(args).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn fs_source_without_path_aborts_construction() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());
        let mut args = base_args(dir.path());
        let mut mesh = MeshConfig::default();
        mesh.config_sources = vec![crate::mesh::ConfigSource {
            address: "fs://".to_string(),
            tls: None,
        }];
        args.mesh_config = Some(mesh);

        let err = Server::new(args).await.unwrap_err();
        assert!(err.to_string().contains("no path"));
    }

    #[tokio::test]
    async fn duplicate_registries_keep_first_instance() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());
        let mut args = base_args(dir.path());
        args.service.registries = vec![provider::MOCK.to_string(), provider::MOCK.to_string()];

        let server = Server::new(args).await.unwrap();
        let registries = server.environment().services.registries();
        let mocks = registries.iter().filter(|r| r.name == provider::MOCK).count();
        let entries = registries
            .iter()
            .filter(|r| r.name == provider::SERVICE_ENTRIES)
            .count();
        assert_eq!(mocks, 1);
        assert_eq!(entries, 1);
        assert_eq!(registries.len(), 2);
    }

    #[tokio::test]
    async fn file_reload_installs_new_mesh_and_pushes_once() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());
        let mesh_file = dir.path().join("mesh.yaml");
        std::fs::write(&mesh_file, "checkServer: m1:9091\n").unwrap();

        let mut args = base_args(dir.path());
        args.mesh.config_file = Some(mesh_file.clone());

        let mut server = Server::new(args).await.unwrap();
        assert_eq!(server.mesh().check_server, "m1:9091");

        let shutdown = Shutdown::new();
        server.start(&shutdown).unwrap();
        let mut pushes = server.discovery().subscribe();

        // Let startup pushes (if any) settle before mutating the file.
        tokio::time::sleep(Duration::from_millis(400)).await;
        while pushes.try_recv().is_ok() {}

        std::fs::write(&mesh_file, "checkServer: m2:9091\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while server.mesh().check_server != "m2:9091" {
            assert!(Instant::now() < deadline, "mesh was not hot-reloaded");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Exactly one full push follows the reload.
        let event = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
            .await
            .expect("push expected after reload")
            .unwrap();
        assert!(event.full);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pushes.try_recv().is_err(), "reload must emit exactly one push");

        // An identical rewrite is not a change and must not push.
        std::fs::write(&mesh_file, "checkServer: m2:9091\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(pushes.try_recv().is_err());

        shutdown.trigger();
        assert!(shutdown.drained(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn serving_waits_for_cache_sync() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());

        // An override controller that is not synced gates every listener.
        let gate = Arc::new(MemoryController::new());
        let mut args = base_args(dir.path());
        args.config.file_dir = None;
        args.config.controller = Some(gate.clone());

        let mut server = Server::new(args).await.unwrap();
        let url = format!("http://{}/version", server.http_addr());

        let shutdown = Shutdown::new();
        server.start(&shutdown).unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(400))
            .build()
            .unwrap();

        // Unsynced: the listener must not answer.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.get(&url).send().await.is_err());

        gate.mark_synced();

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Ok(resp) = client.get(&url).send().await {
                assert!(resp.status().is_success());
                break;
            }
            assert!(Instant::now() < deadline, "server never started serving after sync");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.trigger();
        assert!(shutdown.drained(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_stops_all_listeners_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());
        let mut server = Server::new(base_args(dir.path())).await.unwrap();
        let url = format!("http://{}/version", server.http_addr());

        let shutdown = Shutdown::new();
        server.start(&shutdown).unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        // Wait for serving (file monitor syncs quickly on the empty dir).
        let deadline = Instant::now() + Duration::from_secs(3);
        while client.get(&url).send().await.is_err() {
            assert!(Instant::now() < deadline, "server never came up");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.trigger();
        assert!(
            shutdown.drained(Duration::from_secs(5)).await,
            "background tasks still running after shutdown"
        );
        assert!(client.get(&url).send().await.is_err(), "listener still serving");
    }

    #[tokio::test]
    async fn monitor_listener_serves_before_sync() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dirs(dir.path());

        let gate = Arc::new(MemoryController::new());
        let mut args = base_args(dir.path());
        args.config.file_dir = None;
        args.config.controller = Some(gate);

        let mut server = Server::new(args).await.unwrap();
        let url = format!("http://{}/healthz", server.monitor_addr());

        let shutdown = Shutdown::new();
        server.start(&shutdown).unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Ok(resp) = client.get(&url).send().await {
                assert!(resp.status().is_success());
                break;
            }
            assert!(Instant::now() < deadline, "monitor listener never came up");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.trigger();
        assert!(shutdown.drained(Duration::from_secs(5)).await);
    }
}
