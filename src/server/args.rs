//! Server construction arguments
//!
//! The full parameter record for the discovery service. The CLI populates it
//! from flags; tests build it directly with ephemeral addresses and file
//! fixtures.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigStoreCache;
use crate::mesh::MeshConfig;

/// Default plugin set enabled when none is specified.
pub const DEFAULT_PLUGINS: &[&str] = &["authn", "authz", "health", "telemetry"];

/// Listener addresses for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryServiceOptions {
    /// Admin/debug HTTP address.
    pub http_addr: String,
    /// Plain discovery gRPC address.
    pub grpc_addr: String,
    /// Mutual-TLS discovery address; empty disables the secure listener.
    pub secure_grpc_addr: String,
    /// Monitoring HTTP address.
    pub monitoring_addr: String,
}

impl Default for DiscoveryServiceOptions {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            grpc_addr: "0.0.0.0:15010".to_string(),
            secure_grpc_addr: String::new(),
            monitoring_addr: "0.0.0.0:15014".to_string(),
        }
    }
}

/// Mesh configuration inputs.
#[derive(Debug, Clone, Default)]
pub struct MeshArgs {
    /// Mesh configuration file, watched for changes.
    pub config_file: Option<PathBuf>,
    /// Override for the telemetry check/report endpoints, applied when the
    /// mesh configuration is not file-provided.
    pub telemetry_address: Option<String>,
}

/// Options shared by cluster-facing controllers.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// DNS suffix for service hostnames.
    pub domain_suffix: String,
    /// Restrict watches to one namespace; None watches all.
    pub watched_namespace: Option<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            domain_suffix: "cluster.local".to_string(),
            watched_namespace: None,
        }
    }
}

/// Configuration controller inputs.
#[derive(Clone, Default)]
pub struct ConfigArgs {
    /// Namespace watched for peer-cluster secrets; defaults to the server
    /// namespace.
    pub cluster_registries_namespace: String,
    /// Local directory of configuration YAML; selects the file-monitor
    /// composition and disables the cluster client.
    pub file_dir: Option<PathBuf>,
    /// Caller-supplied controller overriding every other composition rule.
    pub controller: Option<Arc<dyn ConfigStoreCache>>,
    /// Cluster controller tuning.
    pub controller_options: ControllerOptions,
}

/// Consul registry configuration.
#[derive(Debug, Clone)]
pub struct ConsulArgs {
    /// Agent URL, e.g. `http://127.0.0.1:8500`.
    pub server_url: String,
    /// Catalog poll interval.
    pub interval: Duration,
}

impl Default for ConsulArgs {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            interval: Duration::from_secs(2),
        }
    }
}

/// Composite configuration for all service registries.
#[derive(Debug, Clone, Default)]
pub struct ServiceArgs {
    /// Registry adapter names to enable.
    pub registries: Vec<String>,
    /// Consul settings, used when the Consul registry is enabled.
    pub consul: ConsulArgs,
}

/// HTTP/2 keepalive tuning.
#[derive(Debug, Clone)]
pub struct KeepaliveOptions {
    /// Ping interval.
    pub interval: Duration,
    /// Ping timeout.
    pub timeout: Duration,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Every parameter of the discovery service.
#[derive(Clone, Default)]
pub struct ServerArgs {
    /// Listener addresses.
    pub discovery: DiscoveryServiceOptions,
    /// Server namespace; empty falls back to `POD_NAMESPACE`, then the
    /// built-in default.
    pub namespace: String,
    /// Mesh inputs.
    pub mesh: MeshArgs,
    /// Config controller inputs.
    pub config: ConfigArgs,
    /// Service registry inputs.
    pub service: ServiceArgs,
    /// Preloaded mesh configuration; skips file and cluster loading.
    pub mesh_config: Option<MeshConfig>,
    /// Network topology file, watched for changes.
    pub networks_config_file: Option<PathBuf>,
    /// Enabled plugins.
    pub plugins: Vec<String>,
    /// Maximum message size accepted from remote config sources.
    pub max_message_size: usize,
    /// Initial stream window for remote config sources.
    pub initial_window_size: u32,
    /// Initial connection window for remote config sources.
    pub initial_conn_window_size: u32,
    /// Keepalive tuning for all gRPC transports.
    pub keepalive: KeepaliveOptions,
    /// Stop abruptly instead of draining gRPC streams; used by tests.
    pub force_stop: bool,
}

impl ServerArgs {
    /// Arguments with every default filled in.
    pub fn new() -> Self {
        Self {
            plugins: DEFAULT_PLUGINS.iter().map(|p| p.to_string()).collect(),
            max_message_size: crate::config::remote::DEFAULT_MAX_MESSAGE_SIZE,
            initial_window_size: crate::config::remote::DEFAULT_INITIAL_WINDOW_SIZE,
            initial_conn_window_size: crate::config::remote::DEFAULT_INITIAL_CONN_WINDOW_SIZE,
            ..Default::default()
        }
    }
}
