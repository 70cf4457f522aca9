//! Streaming remote configuration sources
//!
//! Each non-`fs://` entry in `mesh.configSources` becomes one
//! [`RemoteSource`]: a gRPC client that keeps a resource stream open to the
//! producer, feeds state-of-the-world sets into a [`MemoryController`], and
//! asks the push engine for a full push after every applied set. Transport
//! failures reconnect with backoff; the store keeps serving the last-known
//! view in the meantime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{info, warn};

use super::memory::MemoryController;
use super::ConfigEntry;
use crate::discovery::{PushRequest, UpdateSink};
use crate::lifecycle::ShutdownSignal;
use crate::mesh::{TlsMode, TlsSettings};
use crate::proto::resource_source_client::ResourceSourceClient;
use crate::proto::{ResourceRequest, ResourceSet};
use crate::{Error, Result};

/// How often the presence of required credential files is re-checked.
pub const CERT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Default maximum message size accepted from a source.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default initial per-stream flow-control window.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 1024 * 1024;

/// Default initial connection flow-control window.
pub const DEFAULT_INITIAL_CONN_WINDOW_SIZE: u32 = 1024 * 1024;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Connection tuning for remote sources.
#[derive(Debug, Clone)]
pub struct RemoteSourceOptions {
    /// Maximum accepted message size in bytes.
    pub max_message_size: usize,
    /// Initial per-stream window size in bytes.
    pub initial_window_size: u32,
    /// Initial connection window size in bytes.
    pub initial_conn_window_size: u32,
    /// HTTP/2 keepalive ping interval.
    pub keepalive_interval: Duration,
    /// Keepalive ping timeout.
    pub keepalive_timeout: Duration,
}

impl Default for RemoteSourceOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_conn_window_size: DEFAULT_INITIAL_CONN_WINDOW_SIZE,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolved client credentials for one source.
#[derive(Debug, Clone)]
pub enum SourceCredentials {
    /// Plaintext connection.
    Insecure,
    /// Server TLS; the server certificate is verified against the provided
    /// CA bundle when given, otherwise the system roots.
    Simple {
        /// Optional CA bundle path.
        ca_certificates: Option<PathBuf>,
        /// Optional SNI override.
        sni: Option<String>,
    },
    /// Mutual TLS with the given credential trio.
    Mutual {
        /// Client certificate path.
        client_certificate: PathBuf,
        /// Client key path.
        private_key: PathBuf,
        /// CA bundle path.
        ca_certificates: PathBuf,
        /// Optional SNI override.
        sni: Option<String>,
    },
}

impl SourceCredentials {
    /// Derive credentials from a source's TLS settings. `mesh-mutual` pulls
    /// the well-known trio from `auth_certs_dir`.
    pub fn from_settings(settings: Option<&TlsSettings>, auth_certs_dir: &Path) -> Result<Self> {
        let Some(settings) = settings else {
            return Ok(Self::Insecure);
        };
        match settings.mode {
            TlsMode::None => Ok(Self::Insecure),
            TlsMode::Simple => Ok(Self::Simple {
                ca_certificates: settings.ca_certificates.as_ref().map(PathBuf::from),
                sni: settings.sni.clone(),
            }),
            TlsMode::Mutual => {
                let require = |field: &Option<String>, name: &str| {
                    field
                        .as_ref()
                        .map(PathBuf::from)
                        .ok_or_else(|| Error::config(format!("mutual tls source missing {name}")))
                };
                Ok(Self::Mutual {
                    client_certificate: require(&settings.client_certificate, "clientCertificate")?,
                    private_key: require(&settings.private_key, "privateKey")?,
                    ca_certificates: require(&settings.ca_certificates, "caCertificates")?,
                    sni: settings.sni.clone(),
                })
            }
            TlsMode::MeshMutual => Ok(Self::Mutual {
                client_certificate: auth_certs_dir.join(crate::CERT_CHAIN_FILENAME),
                private_key: auth_certs_dir.join(crate::KEY_FILENAME),
                ca_certificates: auth_certs_dir.join(crate::ROOT_CERT_FILENAME),
                sni: settings.sni.clone(),
            }),
        }
    }

    /// Credential files that must exist before dialing; empty unless mutual.
    pub fn required_files(&self) -> Vec<PathBuf> {
        match self {
            Self::Mutual {
                client_certificate,
                private_key,
                ca_certificates,
                ..
            } => vec![
                ca_certificates.clone(),
                private_key.clone(),
                client_certificate.clone(),
            ],
            _ => Vec::new(),
        }
    }
}

/// Block until every listed credential file exists, polling every
/// [`CERT_CHECK_INTERVAL`]. Cancellable through the shutdown signal.
pub async fn wait_for_credential_files(files: &[PathBuf], mut stop: ShutdownSignal) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    info!(?files, "secure config source, waiting for required certificate files");
    let mut remaining: Vec<&PathBuf> = files.iter().collect();
    while let Some(next) = remaining.first() {
        if next.exists() {
            info!(file = %next.display(), "found");
            remaining.remove(0);
            continue;
        }
        info!(file = %next.display(), "not found, checking again in {:?}", CERT_CHECK_INTERVAL);
        tokio::select! {
            _ = stop.recv() => {
                return Err(Error::cancelled("stopped while waiting for credential files"));
            }
            _ = tokio::time::sleep(CERT_CHECK_INTERVAL) => {}
        }
    }
    Ok(())
}

/// Build the lazily-connecting channel for a source. Flow-control windows,
/// message size, and keepalive come from the options; the actual connection
/// is established on first use by the stream loop.
pub fn connect(
    address: &str,
    credentials: &SourceCredentials,
    opts: &RemoteSourceOptions,
) -> Result<Channel> {
    let scheme = match credentials {
        SourceCredentials::Insecure => "http",
        _ => "https",
    };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
        .map_err(|e| Error::config(format!("invalid config source address {address:?}: {e}")))?
        .initial_stream_window_size(Some(opts.initial_window_size))
        .initial_connection_window_size(Some(opts.initial_conn_window_size))
        .http2_keep_alive_interval(opts.keepalive_interval)
        .keep_alive_timeout(opts.keepalive_timeout)
        .keep_alive_while_idle(true);

    match credentials {
        SourceCredentials::Insecure => {}
        SourceCredentials::Simple {
            ca_certificates,
            sni,
        } => {
            let mut tls = ClientTlsConfig::new().with_native_roots();
            if let Some(ca) = ca_certificates {
                tls = tls.ca_certificate(Certificate::from_pem(std::fs::read(ca)?));
            }
            if let Some(sni) = sni {
                tls = tls.domain_name(sni.clone());
            }
            endpoint = endpoint.tls_config(tls)?;
        }
        SourceCredentials::Mutual {
            client_certificate,
            private_key,
            ca_certificates,
            sni,
        } => {
            let cert = std::fs::read(client_certificate)?;
            let key = std::fs::read(private_key)?;
            let ca = std::fs::read(ca_certificates)?;
            let mut tls = ClientTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .ca_certificate(Certificate::from_pem(ca));
            if let Some(sni) = sni {
                tls = tls.domain_name(sni.clone());
            }
            endpoint = endpoint.tls_config(tls)?;
        }
    }

    Ok(endpoint.connect_lazy())
}

/// One remote source: its channel, backing store, and stream loop.
pub struct RemoteSource {
    address: String,
    channel: Channel,
    controller: Arc<MemoryController>,
    sink: Arc<dyn UpdateSink>,
    collections: Vec<String>,
    node_id: String,
    max_message_size: usize,
    received: Mutex<HashSet<String>>,
}

impl RemoteSource {
    /// Create a source over an established channel.
    pub fn new(
        address: impl Into<String>,
        channel: Channel,
        controller: Arc<MemoryController>,
        sink: Arc<dyn UpdateSink>,
        collections: Vec<String>,
        node_id: impl Into<String>,
        max_message_size: usize,
    ) -> Self {
        Self {
            address: address.into(),
            channel,
            controller,
            sink,
            collections,
            node_id: node_id.into(),
            max_message_size,
            received: Mutex::new(HashSet::new()),
        }
    }

    /// Source address, for logging and debug endpoints.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The store this source feeds.
    pub fn controller(&self) -> Arc<MemoryController> {
        self.controller.clone()
    }

    /// Apply one received set: reconcile the store, track sync, request a
    /// push attributed to the collection.
    fn apply(&self, set: ResourceSet) {
        let entries: Vec<ConfigEntry> = set
            .resources
            .into_iter()
            .filter_map(|res| {
                let spec = match serde_json::from_slice(&res.body) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!(source = %self.address, name = %res.name, error = %e,
                            "dropping resource with unparseable body");
                        return None;
                    }
                };
                Some(ConfigEntry {
                    kind: set.collection.clone(),
                    name: res.name,
                    namespace: res.namespace,
                    spec,
                    ..Default::default()
                })
            })
            .collect();

        self.controller.apply_snapshot(&set.collection, entries);

        {
            let mut received = self.received.lock().expect("received lock poisoned");
            received.insert(set.collection.clone());
            if received.len() >= self.collections.len() {
                self.controller.mark_synced();
            }
        }

        self.sink
            .config_update(PushRequest::for_types([set.collection]));
    }

    async fn stream_once(&self) -> Result<()> {
        let mut client = ResourceSourceClient::new(self.channel.clone())
            .max_decoding_message_size(self.max_message_size);

        let (tx, rx) = mpsc::channel(8);
        tx.send(ResourceRequest {
            collections: self.collections.clone(),
            node_id: self.node_id.clone(),
            response_nonce: String::new(),
            error_detail: String::new(),
        })
        .await
        .map_err(|_| Error::config("request channel closed before dial"))?;

        let mut inbound = client
            .stream_resources(ReceiverStream::new(rx))
            .await
            .map_err(|e| Error::config(format!("source {} dial failed: {e}", self.address)))?
            .into_inner();

        info!(source = %self.address, "resource stream established");

        while let Some(set) = inbound
            .message()
            .await
            .map_err(|e| Error::config(format!("source {} stream error: {e}", self.address)))?
        {
            let nonce = set.nonce.clone();
            self.apply(set);
            let ack = ResourceRequest {
                collections: Vec::new(),
                node_id: self.node_id.clone(),
                response_nonce: nonce,
                error_detail: String::new(),
            };
            if tx.send(ack).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Stream loop: dial, consume, reconnect with backoff until shutdown.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                result = self.stream_once() => match result {
                    Ok(()) => {
                        info!(source = %self.address, "resource stream ended, reconnecting");
                        backoff = RECONNECT_BACKOFF_INITIAL;
                    }
                    Err(e) => {
                        warn!(source = %self.address, error = %e, "resource stream failed");
                    }
                }
            }
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
        info!(source = %self.address, "resource stream reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;

    #[test]
    fn credentials_from_settings() {
        let auth_dir = Path::new("/etc/certs");

        let creds = SourceCredentials::from_settings(None, auth_dir).unwrap();
        assert!(matches!(creds, SourceCredentials::Insecure));

        let mutual = TlsSettings {
            mode: TlsMode::Mutual,
            client_certificate: Some("/c/cert.pem".to_string()),
            private_key: Some("/c/key.pem".to_string()),
            ca_certificates: Some("/c/ca.pem".to_string()),
            sni: None,
        };
        let creds = SourceCredentials::from_settings(Some(&mutual), auth_dir).unwrap();
        assert_eq!(creds.required_files().len(), 3);

        let mesh_mutual = TlsSettings {
            mode: TlsMode::MeshMutual,
            ..Default::default()
        };
        let creds = SourceCredentials::from_settings(Some(&mesh_mutual), auth_dir).unwrap();
        let files = creds.required_files();
        assert!(files
            .iter()
            .any(|f| f == &auth_dir.join(crate::ROOT_CERT_FILENAME)));
    }

    #[test]
    fn mutual_without_files_is_init_error() {
        let settings = TlsSettings {
            mode: TlsMode::Mutual,
            ..Default::default()
        };
        assert!(SourceCredentials::from_settings(Some(&settings), Path::new("/etc/certs")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cert_wait_blocks_until_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        let key = dir.path().join("key.pem");
        let cert = dir.path().join("cert.pem");
        std::fs::write(&ca, "ca").unwrap();
        std::fs::write(&key, "key").unwrap();
        // cert.pem intentionally absent.

        let shutdown = Shutdown::new();
        let files = vec![ca, key, cert.clone()];
        let stop = shutdown.subscribe();
        let waiter = tokio::spawn(async move { wait_for_credential_files(&files, stop).await });

        // Several poll intervals elapse without the file.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!waiter.is_finished());

        std::fs::write(&cert, "cert").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(waiter.is_finished());
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cert_wait_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never.pem");

        let shutdown = Shutdown::new();
        let stop = shutdown.subscribe();
        let files = vec![missing];
        let waiter = tokio::spawn(async move { wait_for_credential_files(&files, stop).await });

        tokio::time::sleep(Duration::from_millis(700)).await;
        shutdown.trigger();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[test]
    fn connect_rejects_garbage_address() {
        let opts = RemoteSourceOptions::default();
        let result = connect("not a uri\u{0}", &SourceCredentials::Insecure, &opts);
        assert!(result.is_err());
    }
}
