//! Admin and debug HTTP endpoints
//!
//! Served on the plain HTTP listener and reachable through the secure
//! listener's HTTP face. Read-only views over the environment; nothing here
//! mutates control-plane state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use super::DiscoveryServer;
use crate::registry::{RegistryController, ServiceDiscovery};

/// Build the admin router over the push engine.
pub fn admin_router(discovery: Arc<DiscoveryServer>) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/version", get(version))
        .route("/debug/meshz", get(meshz))
        .route("/debug/configz", get(configz))
        .route("/debug/registryz", get(registryz))
        .route("/debug/pushz", get(pushz))
        .with_state(discovery)
}

/// Build the monitoring router: liveness and version only.
pub fn monitor_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/version", get(version_static))
}

async fn ready(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    if discovery.environment().has_synced() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches syncing")
    }
}

async fn version(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "plugins": discovery.plugins(),
    }))
}

async fn version_static() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn meshz(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    let env = discovery.environment();
    Json(json!({
        "mesh": &*env.mesh(),
        "networks": &*env.networks(),
    }))
}

async fn configz(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    let env = discovery.environment();
    let by_kind: serde_json::Map<String, serde_json::Value> = crate::config::collections::all()
        .iter()
        .map(|kind| {
            let entries = env.config.list(kind, None);
            ((*kind).to_string(), json!(entries))
        })
        .collect();
    Json(serde_json::Value::Object(by_kind))
}

async fn registryz(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    let env = discovery.environment();
    let registries: Vec<serde_json::Value> = env
        .services
        .registries()
        .iter()
        .map(|r| json!({ "name": r.name, "clusterId": r.cluster_id, "synced": r.controller.has_synced() }))
        .collect();
    let services = env.services.services().unwrap_or_default();
    Json(json!({ "registries": registries, "services": services }))
}

async fn pushz(State(discovery): State<Arc<DiscoveryServer>>) -> impl IntoResponse {
    Json(json!({
        "version": discovery.version(),
        "synced": discovery.environment().has_synced(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryController;
    use crate::discovery::Environment;
    use crate::mesh::{MeshConfig, MeshNetworks};
    use crate::registry::aggregate::ServiceAggregate;
    use axum::body::Body;
    use http::Request;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn discovery() -> (Arc<MemoryController>, Arc<DiscoveryServer>) {
        let (_, mesh_rx) = watch::channel(Arc::new(MeshConfig::default()));
        let (_, networks_rx) = watch::channel(Arc::new(MeshNetworks::default()));
        let config = Arc::new(MemoryController::new());
        let services = Arc::new(ServiceAggregate::new());
        let env = Environment::new(mesh_rx, networks_rx, config.clone(), services);
        (config, DiscoveryServer::new(env, vec!["health".to_string()]))
    }

    #[tokio::test]
    async fn ready_tracks_cache_sync() {
        let (config, discovery) = discovery();
        let router = admin_router(discovery);

        let resp = router
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        config.mark_synced();
        let resp = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn debug_endpoints_respond() {
        let (_, discovery) = discovery();
        let router = admin_router(discovery);

        for path in ["/version", "/debug/meshz", "/debug/configz", "/debug/registryz", "/debug/pushz"] {
            let resp = router
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "endpoint {path}");
        }
    }
}
