//! Inbound HTTP(S) listener: peers probe `/nodeinfo` and push snapshots
//! to `/report`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use chrono::Duration as ChronoDuration;
use log::{info, warn};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, NodeIdentity};
use crate::error::Error;
use crate::merge::MergeEngine;
use crate::registry::Registry;
use crate::store::PollStore;
use crate::types::{now, NetworkSnapshot, NodeInfo, REPORT_SOURCE};

const TLS_DRAIN: Duration = Duration::from_secs(5);

pub struct AppState {
    pub registry: Arc<Registry>,
    pub merger: Arc<MergeEngine>,
    pub history: Arc<dyn PollStore>,
    pub identity: NodeIdentity,
    pub started: Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodeinfo", get(node_info))
        .route("/report", post(report))
        .route("/health", get(health))
        .route("/nodes/:id", delete(delete_node))
        .with_state(state)
}

async fn node_info(State(state): State<Arc<AppState>>) -> Json<NodeInfo> {
    Json(NodeInfo {
        id: state.identity.id.clone(),
        fqdn: state.identity.fqdn.clone(),
        ip: state.identity.ip.clone(),
        nodes: state.registry.all().await,
    })
}

fn rejected(err: Error) -> (StatusCode, Json<Value>) {
    warn!("Rejected network snapshot: {}", err);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": err.to_string() })),
    )
}

async fn report(State(state): State<Arc<AppState>>, body: Bytes) -> (StatusCode, Json<Value>) {
    let snapshot: NetworkSnapshot = match serde_json::from_slice(&body) {
        Ok(snapshot) => snapshot,
        Err(e) => return rejected(Error::Validation(e.to_string())),
    };
    if let Err(e) = snapshot.validate() {
        return rejected(e);
    }

    let reporter = snapshot.reporting_node_id.clone();
    let count = snapshot.nodes.len();
    let merged = state
        .merger
        .merge(&NodeInfo::from(snapshot), REPORT_SOURCE)
        .await;
    info!(
        "Received network snapshot from {} with {} nodes ({} new)",
        reporter, count, merged.inserted
    );

    (
        StatusCode::OK,
        Json(json!({ "status": "success", "message": "Network snapshot received" })),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let recent = match state
        .history
        .outcomes_since(now() - ChronoDuration::hours(1))
        .await
    {
        Ok(recent) => recent,
        Err(e) => {
            warn!("Failed to read poll history: {}", e);
            Vec::new()
        }
    };
    let failed = recent.iter().filter(|o| !o.success).count();

    Json(json!({
        "status": "healthy",
        "timestamp": now(),
        "node_id": state.identity.id,
        "node_fqdn": state.identity.fqdn,
        "node_ip": state.identity.ip,
        "known_nodes": state.registry.len().await,
        "active_nodes": state.registry.active().await.len(),
        "polls_last_hour": recent.len(),
        "failed_polls_last_hour": failed,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn delete_node(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    match state.registry.delete(&id).await {
        Ok(node) => {
            info!("Removed node {} ({})", node.id, node.locator());
            StatusCode::NO_CONTENT
        }
        Err(Error::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!("Failed to remove node {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Serves `router` until `cancel` fires.  HTTPS when the config names a
/// certificate and key, plain HTTP otherwise.
pub async fn serve(
    router: Router,
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = config.listen;
    match config.tls_files() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load TLS certificate: {}", e))?;
            let handle = Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                shutdown.graceful_shutdown(Some(TLS_DRAIN));
            });

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(router.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Listening on http://{}", addr);
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await?;
        }
    }
    info!("Listener stopped");
    Ok(())
}
