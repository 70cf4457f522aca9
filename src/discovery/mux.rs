//! Secure listener: one TLS socket, two protocols
//!
//! The secure discovery port accepts mutual-TLS connections and serves both
//! gRPC discovery streams and the admin HTTP endpoints on the same socket.
//! Dispatch is by protocol: HTTP/2 requests with a gRPC content type go to
//! the discovery service, everything else to the admin mux.
//!
//! Client certificates must chain to the configured root CA. Identity is not
//! checked beyond that; the requirement exists for privacy, not
//! authorization.

use std::convert::Infallible;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use axum::Router;
use http::header::CONTENT_TYPE;
use http::{Request, Version};
use rustls::pki_types::PrivateKeyDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tower::Service;

use crate::{Error, Result};

/// Whether a request should be dispatched to the gRPC handler.
pub fn is_grpc_request<B>(req: &Request<B>) -> bool {
    req.version() == Version::HTTP_2
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/grpc"))
}

/// Protocol-dispatching service over the web and gRPC routers.
#[derive(Clone)]
pub struct SecureMux {
    web: Router,
    grpc: Router,
}

impl SecureMux {
    /// Create the mux.
    pub fn new(web: Router, grpc: Router) -> Self {
        Self { web, grpc }
    }

    /// Wrap the mux into a router suitable for serving.
    pub fn into_router(self) -> Router {
        Router::new().fallback_service(self)
    }
}

impl Service<Request<Body>> for SecureMux {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut target = if is_grpc_request(&req) {
            self.grpc.clone()
        } else {
            self.web.clone()
        };
        Box::pin(async move { target.call(req).await })
    }
}

/// Build the rustls configuration for the secure listener from the
/// certificate directory holding the well-known trio.
///
/// ALPN advertises `h2` and `http/1.1`; mutual TLS is required with client
/// chains verified against the root certificate.
pub fn server_tls_config(cert_dir: &Path) -> Result<ServerConfig> {
    let cert_path = cert_dir.join(crate::CERT_CHAIN_FILENAME);
    let key_path = cert_dir.join(crate::KEY_FILENAME);
    let root_path = cert_dir.join(crate::ROOT_CERT_FILENAME);

    let certs = read_certs(&cert_path)?;
    let key = read_key(&key_path)?;

    let mut roots = RootCertStore::empty();
    for root in read_certs(&root_path)? {
        roots
            .add(root)
            .map_err(|e| Error::tls(format!("invalid root certificate: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::tls(format!("client verifier: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("server certificate: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn read_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::tls(format!("reading {}: {e}", path.display())))?;
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(|e| Error::tls(format!("parsing {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::tls(format!("reading {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| Error::tls(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{any, get};
    use http::StatusCode;
    use tower::ServiceExt;

    fn routers() -> (Router, Router) {
        let web = Router::new().route("/debug", get(|| async { "web" }));
        // Stand-in for the gRPC handler: accepts any method on any path.
        let grpc = Router::new().fallback(any(|| async { "grpc" }));
        (web, grpc)
    }

    fn grpc_request() -> Request<Body> {
        let mut req = Request::post("/trellis.discovery.v1.AggregatedDiscovery/StreamAggregatedResources")
            .header(CONTENT_TYPE, "application/grpc")
            .body(Body::empty())
            .unwrap();
        *req.version_mut() = Version::HTTP_2;
        req
    }

    #[test]
    fn grpc_detection_requires_h2_and_content_type() {
        assert!(is_grpc_request(&grpc_request()));

        // gRPC content type over HTTP/1.1 goes to the web mux.
        let mut h1 = Request::post("/x")
            .header(CONTENT_TYPE, "application/grpc")
            .body(())
            .unwrap();
        *h1.version_mut() = Version::HTTP_11;
        assert!(!is_grpc_request(&h1));

        // HTTP/2 without the content type goes to the web mux.
        let mut h2 = Request::get("/debug").body(()).unwrap();
        *h2.version_mut() = Version::HTTP_2;
        assert!(!is_grpc_request(&h2));

        // Suffixed content types still count as gRPC.
        let mut web_grpc = Request::post("/x")
            .header(CONTENT_TYPE, "application/grpc+proto")
            .body(())
            .unwrap();
        *web_grpc.version_mut() = Version::HTTP_2;
        assert!(is_grpc_request(&web_grpc));
    }

    #[tokio::test]
    async fn mux_routes_by_protocol() {
        let (web, grpc) = routers();
        let mux = SecureMux::new(web, grpc).into_router();

        let resp = mux.clone().oneshot(grpc_request()).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"grpc");

        let mut debug = Request::get("/debug").body(Body::empty()).unwrap();
        *debug.version_mut() = Version::HTTP_11;
        let resp = mux.clone().oneshot(debug).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"web");
    }

    #[tokio::test]
    async fn unknown_web_path_is_404_not_grpc() {
        let (web, grpc) = routers();
        let mux = SecureMux::new(web, grpc).into_router();
        let resp = mux
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn tls_config_from_generated_trio() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let ca = crate::security::CertificateAuthority::new("trellis-ca").unwrap();
        let issued = ca.issue_server_cert(&["discovery.trellis.svc".to_string()]).unwrap();

        std::fs::write(dir.path().join(crate::CERT_CHAIN_FILENAME), issued.cert_chain_pem()).unwrap();
        std::fs::write(dir.path().join(crate::KEY_FILENAME), issued.key_pem()).unwrap();
        std::fs::write(dir.path().join(crate::ROOT_CERT_FILENAME), ca.ca_cert_pem()).unwrap();

        let config = server_tls_config(dir.path()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn tls_config_missing_certs_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(server_tls_config(dir.path()).is_err());
    }
}
