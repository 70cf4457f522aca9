//! Trellis binary - discovery server and data-plane proxy supervisor

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::agent::process::ProcessProxy;
use trellis::agent::Agent;
use trellis::lifecycle::Shutdown;
use trellis::server::args::{ConsulArgs, ServerArgs, DEFAULT_PLUGINS};
use trellis::server::Server;
use trellis::watcher::FileWatcher;

/// Trellis - service-mesh control-plane discovery server
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane discovery server
    Discovery(DiscoveryArgs),

    /// Supervise a data-plane proxy with hot restarts
    Proxy(ProxyArgs),
}

/// Discovery server arguments
#[derive(Parser, Debug)]
struct DiscoveryArgs {
    /// Admin/debug HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Discovery gRPC listen address
    #[arg(long, default_value = "0.0.0.0:15010")]
    grpc_addr: String,

    /// Mutual-TLS discovery listen address; empty disables the listener
    #[arg(long, default_value = "")]
    secure_grpc_addr: String,

    /// Monitoring HTTP listen address
    #[arg(long, default_value = "0.0.0.0:15014")]
    monitoring_addr: String,

    /// Server namespace
    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    namespace: String,

    /// Mesh configuration file, hot-reloaded on change
    #[arg(long)]
    mesh_config: Option<PathBuf>,

    /// Network topology file, hot-reloaded on change
    #[arg(long)]
    networks_config: Option<PathBuf>,

    /// Telemetry endpoint override applied to defaulted mesh configuration
    #[arg(long)]
    telemetry_address: Option<String>,

    /// Directory of configuration YAML; replaces the cluster config store
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Namespace watched for peer-cluster secrets
    #[arg(long, default_value = "")]
    cluster_registries_namespace: String,

    /// Service registries to enable
    #[arg(long, value_delimiter = ',', default_value = "Kubernetes")]
    registries: Vec<String>,

    /// Consul agent URL
    #[arg(long, default_value = "")]
    consul_url: String,

    /// Consul catalog poll interval in seconds
    #[arg(long, default_value = "2")]
    consul_interval_secs: u64,

    /// DNS suffix for service hostnames
    #[arg(long, default_value = "cluster.local")]
    domain_suffix: String,

    /// Plugins to enable
    #[arg(long, value_delimiter = ',')]
    plugins: Vec<String>,

    /// Maximum message size accepted from remote config sources, in bytes
    #[arg(long, default_value = "4194304")]
    mcp_max_message_size: usize,

    /// Initial stream window for remote config sources, in bytes
    #[arg(long, default_value = "1048576")]
    mcp_initial_window_size: u32,

    /// Initial connection window for remote config sources, in bytes
    #[arg(long, default_value = "1048576")]
    mcp_initial_conn_window_size: u32,

    /// Keepalive ping interval in seconds
    #[arg(long, default_value = "30")]
    keepalive_interval_secs: u64,

    /// Keepalive ping timeout in seconds
    #[arg(long, default_value = "10")]
    keepalive_timeout_secs: u64,

    /// Stop abruptly instead of draining gRPC streams
    #[arg(long)]
    force_stop: bool,
}

/// Proxy supervisor arguments
#[derive(Parser, Debug)]
struct ProxyArgs {
    /// Data-plane binary to supervise
    #[arg(long)]
    binary: PathBuf,

    /// Proxy configuration file; a change triggers a hot restart
    #[arg(long)]
    proxy_config: PathBuf,

    /// Directory for per-epoch rendered config files
    #[arg(long, default_value = "/var/run/trellis/proxy")]
    config_dir: PathBuf,

    /// Proxy admin address probed for liveness
    #[arg(long, default_value = "127.0.0.1:15000")]
    admin_addr: SocketAddr,

    /// Seconds allowed for draining before remaining epochs are aborted
    #[arg(long, default_value = "5")]
    drain_duration_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Discovery(args) => run_discovery(args).await,
        Commands::Proxy(args) => run_proxy(args).await,
    }
}

async fn run_discovery(args: DiscoveryArgs) -> anyhow::Result<()> {
    let mut server_args = ServerArgs::new();
    server_args.discovery.http_addr = args.http_addr;
    server_args.discovery.grpc_addr = args.grpc_addr;
    server_args.discovery.secure_grpc_addr = args.secure_grpc_addr;
    server_args.discovery.monitoring_addr = args.monitoring_addr;
    server_args.namespace = args.namespace;
    server_args.mesh.config_file = args.mesh_config;
    server_args.mesh.telemetry_address = args.telemetry_address;
    server_args.networks_config_file = args.networks_config;
    server_args.config.file_dir = args.config_dir;
    server_args.config.cluster_registries_namespace = args.cluster_registries_namespace;
    server_args.config.controller_options.domain_suffix = args.domain_suffix;
    server_args.service.registries = args.registries;
    server_args.service.consul = ConsulArgs {
        server_url: args.consul_url,
        interval: Duration::from_secs(args.consul_interval_secs),
    };
    server_args.plugins = if args.plugins.is_empty() {
        DEFAULT_PLUGINS.iter().map(|p| p.to_string()).collect()
    } else {
        args.plugins
    };
    server_args.max_message_size = args.mcp_max_message_size;
    server_args.initial_window_size = args.mcp_initial_window_size;
    server_args.initial_conn_window_size = args.mcp_initial_conn_window_size;
    server_args.keepalive.interval = Duration::from_secs(args.keepalive_interval_secs);
    server_args.keepalive.timeout = Duration::from_secs(args.keepalive_timeout_secs);
    server_args.force_stop = args.force_stop;

    let mut server = Server::new(server_args).await?;
    info!(
        http = %server.http_addr(),
        grpc = %server.grpc_addr(),
        monitor = %server.monitor_addr(),
        "discovery server initialized"
    );

    let shutdown = Shutdown::new();
    server.start(&shutdown)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.trigger();

    if !shutdown.drained(Duration::from_secs(15)).await {
        warn!("some background tasks did not stop in time");
    }
    Ok(())
}

async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    let proxy = std::sync::Arc::new(ProcessProxy::new(
        &args.binary,
        &args.config_dir,
        args.admin_addr,
    ));
    let agent = Agent::new(proxy, Duration::from_secs(args.drain_duration_secs));

    // Initial start plus a hot restart on every config change.
    let config = read_proxy_config(&args.proxy_config)?;
    agent.restart(config).await;

    let watcher = FileWatcher::new()?;
    let restart_agent = agent.clone();
    let config_path = args.proxy_config.clone();
    let (restart_tx, mut restart_rx) = tokio::sync::mpsc::unbounded_channel();
    watcher.add(&args.proxy_config, move || {
        let _ = restart_tx.send(());
    })?;
    tokio::spawn(async move {
        while restart_rx.recv().await.is_some() {
            match read_proxy_config(&config_path) {
                Ok(config) => restart_agent.restart(config).await,
                Err(e) => warn!(error = %e, "ignoring unreadable proxy config"),
            }
        }
    });

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let control = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(stop).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining proxy");
    shutdown.trigger();
    control.await?;
    Ok(())
}

fn read_proxy_config(path: &PathBuf) -> anyhow::Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}
