//! Mesh configuration model and loaders
//!
//! The mesh configuration is the static, operator-supplied half of the
//! control plane's input: where configuration comes from, how ingress is
//! handled, and which certificates to provision. It can be preloaded by the
//! caller, read from a file (and hot-reloaded on change), or fall back to a
//! well-known ConfigMap in the cluster.
//!
//! Snapshots are immutable once installed; hot reload replaces the whole
//! snapshot after a structural comparison, never mutates it in place.

use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

/// Key under which the mesh configuration lives in its ConfigMap.
pub const CONFIG_MAP_KEY: &str = "mesh";

/// Name of the well-known mesh ConfigMap.
pub const CONFIG_MAP_NAME: &str = "trellis";

/// URL scheme denoting a local directory config source, e.g. `fs:///etc/config`.
pub const FS_SCHEME: &str = "fs://";

/// TLS mode for a remote config source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Plaintext connection.
    #[default]
    None,
    /// Server TLS without client identity.
    Simple,
    /// Mutual TLS with explicitly listed credential files.
    Mutual,
    /// Mutual TLS using the mesh's own provisioned certificate trio.
    MeshMutual,
}

/// TLS settings for a remote config source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsSettings {
    /// Connection mode.
    pub mode: TlsMode,
    /// Client certificate file, required for `mutual`.
    pub client_certificate: Option<String>,
    /// Client private key file, required for `mutual`.
    pub private_key: Option<String>,
    /// CA bundle used to verify the server, required for `mutual`.
    pub ca_certificates: Option<String>,
    /// SNI override presented during the handshake.
    pub sni: Option<String>,
}

/// A producer of configuration objects: a local directory (`fs://PATH`) or a
/// streaming remote endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigSource {
    /// Source address. `fs://PATH` selects a directory source; anything else
    /// is dialed as a streaming resource endpoint.
    pub address: String,
    /// TLS policy for remote sources.
    pub tls: Option<TlsSettings>,
}

impl ConfigSource {
    /// Returns the directory path when this source uses the `fs://` scheme.
    ///
    /// An `fs://` address with an empty path is an initialization error and
    /// is reported by the config controller, not here.
    pub fn fs_path(&self) -> Option<&str> {
        self.address.strip_prefix(FS_SCHEME)
    }
}

/// A certificate the control plane provisions for itself or another service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CertificateEntry {
    /// When set, the key/cert pair is maintained inside this Secret by the
    /// rotation loop. When empty, the pair is written to the local key-cert
    /// directory (first such entry only).
    pub secret_name: Option<String>,
    /// DNS names placed in the certificate. An entry without any name is
    /// skipped.
    pub dns_names: Vec<String>,
}

/// Ingress handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressMode {
    /// Ingress resources are ignored.
    Off,
    /// Ingress resources without a class annotation are claimed.
    #[default]
    Default,
    /// Only explicitly annotated ingress resources are claimed.
    Strict,
}

/// The active mesh configuration snapshot.
///
/// Comparison is structural: every field is semantic content, so `PartialEq`
/// is the change detector used by hot reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// Endpoint receiving policy-check calls from data-plane proxies.
    pub check_server: String,
    /// Endpoint receiving telemetry reports from data-plane proxies.
    pub report_server: String,
    /// Trust domain used in workload identities.
    pub trust_domain: String,
    /// Namespace holding mesh-wide configuration.
    pub root_namespace: String,
    /// Ingress claim mode.
    pub ingress_controller_mode: IngressMode,
    /// Configuration sources aggregated by the config controller. Changing
    /// this set requires a restart; hot reload does not rewire sources.
    pub config_sources: Vec<ConfigSource>,
    /// Certificates to provision.
    pub certificates: Vec<CertificateEntry>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            check_server: String::new(),
            report_server: String::new(),
            trust_domain: "cluster.local".to_string(),
            root_namespace: "trellis-system".to_string(),
            ingress_controller_mode: IngressMode::default(),
            config_sources: Vec::new(),
            certificates: Vec::new(),
        }
    }
}

/// Network topology: named networks with their endpoint membership rules and
/// ingress gateways.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshNetworks {
    /// Network name to definition.
    pub networks: BTreeMap<String, Network>,
}

/// A single named network.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Network {
    /// Rules assigning workloads to this network.
    pub endpoints: Vec<NetworkEndpoints>,
    /// Gateways through which other networks reach this one.
    pub gateways: Vec<NetworkGateway>,
}

/// Membership rule for a network.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkEndpoints {
    /// All endpoints of the named registry (cluster id) belong to the network.
    pub from_registry: Option<String>,
    /// Endpoints within the CIDR belong to the network.
    pub from_cidr: Option<String>,
}

/// Cross-network ingress gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkGateway {
    /// IP or hostname. Hostnames are resolved at load time.
    pub address: String,
    /// Gateway port.
    pub port: u16,
}

/// Read and parse a mesh configuration file, applying defaults for absent
/// fields.
pub fn read_mesh_config(path: impl AsRef<Path>) -> Result<MeshConfig> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_mesh_config(&content)
}

/// Parse a mesh configuration document.
pub fn parse_mesh_config(content: &str) -> Result<MeshConfig> {
    let mesh: MeshConfig = serde_yaml::from_str(content)
        .map_err(|e| Error::mesh(format!("invalid mesh configuration: {e}")))?;
    for source in &mesh.config_sources {
        if source.address.is_empty() {
            return Err(Error::mesh("config source with empty address"));
        }
    }
    Ok(mesh)
}

/// Read and parse a mesh networks file, resolving gateway hostnames.
pub fn read_mesh_networks(path: impl AsRef<Path>) -> Result<MeshNetworks> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mut networks: MeshNetworks = serde_yaml::from_str(&content)
        .map_err(|e| Error::mesh(format!("invalid mesh networks configuration: {e}")))?;
    resolve_gateway_hosts(&mut networks);
    Ok(networks)
}

/// Resolve gateway hostnames to IP addresses in place.
///
/// Unresolvable names are kept as-is so a transient DNS failure does not drop
/// the gateway from the topology.
pub fn resolve_gateway_hosts(networks: &mut MeshNetworks) {
    for (name, network) in networks.networks.iter_mut() {
        for gateway in network.gateways.iter_mut() {
            if gateway.address.parse::<IpAddr>().is_ok() {
                continue;
            }
            match (gateway.address.as_str(), gateway.port).to_socket_addrs() {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        info!(network = %name, host = %gateway.address, ip = %addr.ip(),
                            "resolved gateway address");
                        gateway.address = addr.ip().to_string();
                    }
                }
                Err(e) => {
                    warn!(network = %name, host = %gateway.address, error = %e,
                        "failed to resolve gateway address, keeping hostname");
                }
            }
        }
    }
}

/// Fetch the mesh configuration from the well-known cluster ConfigMap.
///
/// A missing ConfigMap yields the default configuration; a ConfigMap without
/// the expected key is an error.
pub async fn from_config_map(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> Result<MeshConfig> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let cm = match api.get(name).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(%namespace, %name, "mesh ConfigMap not found, using defaults");
            return Ok(MeshConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let data = cm.data.unwrap_or_default();
    let content = data
        .get(CONFIG_MAP_KEY)
        .ok_or_else(|| Error::mesh(format!("missing configuration map key {CONFIG_MAP_KEY:?}")))?;
    parse_mesh_config(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_absent_fields() {
        let mesh = parse_mesh_config("checkServer: check.local:9091\n").unwrap();
        assert_eq!(mesh.check_server, "check.local:9091");
        assert_eq!(mesh.trust_domain, "cluster.local");
        assert_eq!(mesh.ingress_controller_mode, IngressMode::Default);
        assert!(mesh.config_sources.is_empty());
    }

    #[test]
    fn structural_comparison_detects_field_change() {
        let a = parse_mesh_config("checkServer: m1:9091\n").unwrap();
        let b = parse_mesh_config("checkServer: m2:9091\n").unwrap();
        let a_again = parse_mesh_config("checkServer: m1:9091\n").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a_again);
    }

    #[test]
    fn config_source_fs_scheme() {
        let source = ConfigSource {
            address: "fs:///etc/trellis/config".to_string(),
            tls: None,
        };
        assert_eq!(source.fs_path(), Some("/etc/trellis/config"));

        let remote = ConfigSource {
            address: "config.trellis-system:15010".to_string(),
            tls: None,
        };
        assert_eq!(remote.fs_path(), None);
    }

    #[test]
    fn tls_modes_parse_kebab_case() {
        let yaml = r#"
configSources:
  - address: config.remote:15010
    tls:
      mode: mesh-mutual
  - address: other.remote:15010
    tls:
      mode: mutual
      clientCertificate: /certs/client.pem
      privateKey: /certs/key.pem
      caCertificates: /certs/ca.pem
"#;
        let mesh = parse_mesh_config(yaml).unwrap();
        assert_eq!(mesh.config_sources.len(), 2);
        assert_eq!(
            mesh.config_sources[0].tls.as_ref().unwrap().mode,
            TlsMode::MeshMutual
        );
        assert_eq!(
            mesh.config_sources[1].tls.as_ref().unwrap().mode,
            TlsMode::Mutual
        );
    }

    #[test]
    fn empty_source_address_rejected() {
        let yaml = "configSources:\n  - address: \"\"\n";
        assert!(parse_mesh_config(yaml).is_err());
    }

    #[test]
    fn gateway_ip_addresses_left_untouched() {
        let mut networks = MeshNetworks::default();
        networks.networks.insert(
            "nw1".to_string(),
            Network {
                endpoints: vec![NetworkEndpoints {
                    from_registry: Some("remote0".to_string()),
                    from_cidr: None,
                }],
                gateways: vec![NetworkGateway {
                    address: "10.0.0.1".to_string(),
                    port: 443,
                }],
            },
        );
        resolve_gateway_hosts(&mut networks);
        assert_eq!(networks.networks["nw1"].gateways[0].address, "10.0.0.1");
    }

    #[test]
    fn gateway_localhost_resolves() {
        let mut networks = MeshNetworks::default();
        networks.networks.insert(
            "nw1".to_string(),
            Network {
                endpoints: vec![],
                gateways: vec![NetworkGateway {
                    address: "localhost".to_string(),
                    port: 443,
                }],
            },
        );
        resolve_gateway_hosts(&mut networks);
        let resolved = &networks.networks["nw1"].gateways[0].address;
        assert!(resolved.parse::<IpAddr>().is_ok(), "got {resolved}");
    }
}
