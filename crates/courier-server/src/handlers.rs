//! HTTP endpoints and node bootstrap.
//!
//! Serves the WebSocket endpoint, `/health` and `/stats`, and runs the
//! cluster listener next to them.

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::Config;
use crate::metrics;
use crate::pump;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tenvis_courier_core::{
    cluster::tcp, Cluster, ClusterLink, ClusterService, Hub, MemoryStore, TcpLink, TracingPush,
};
use tenvis_courier_transport::{WebSocketConfig, WebSocketConnection};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Period of the stats gauges refresh.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The node's hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Resolves `connect` tokens.
    pub auth: Arc<dyn Authenticator>,
    pub(crate) connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: Arc<Hub>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            hub,
            config,
            auth,
            connections: AtomicUsize::new(0),
        }
    }
}

/// Build the hub of this node with TCP links to its peers.
#[must_use]
pub fn build_hub(config: &Config) -> Arc<Hub> {
    let links: HashMap<String, Arc<dyn ClusterLink>> = config
        .cluster
        .peers
        .iter()
        .map(|peer| {
            let link: Arc<dyn ClusterLink> = Arc::new(TcpLink::new(&peer.name, &peer.address));
            (peer.name.clone(), link)
        })
        .collect();
    let cluster = Arc::new(Cluster::new(config.cluster_config(), links));

    Hub::new(
        config.hub_config(),
        cluster,
        Arc::new(MemoryStore::new()),
        Arc::new(TracingPush),
    )
}

/// HTTP routes of a node.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serve HTTP on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

/// Run a node: hub, cluster listener, metrics and HTTP server.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    let hub = build_hub(&config);
    hub.start();
    let auth = Arc::new(TokenAuthenticator::new(&config.auth));
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&hub), auth));
    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let cluster_listener = TcpListener::bind(&config.cluster.listen)
        .await
        .with_context(|| format!("Failed to bind cluster listener {}", config.cluster.listen))?;
    let service: Arc<dyn ClusterService> = hub.clone();
    tokio::spawn(tcp::serve(cluster_listener, service, shutdown.clone()));

    tokio::spawn(sample_stats(Arc::clone(&hub), shutdown.clone()));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(node = %hub.node(), "Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let served = serve(listener, state, shutdown.clone()).await;
    shutdown.cancel();
    hub.shutdown();
    served
}

async fn sample_stats(hub: Arc<Hub>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                metrics::set_hub_stats(&hub.stats());
                metrics::set_cluster_health(hub.cluster().membership().nodes());
            }
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "node": state.hub.node(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Node statistics and cluster view.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let membership = state.hub.cluster().membership();
    let nodes: serde_json::Map<String, serde_json::Value> = membership
        .nodes()
        .map(|(name, health)| (name.to_string(), health.to_string().into()))
        .collect();

    Json(serde_json::json!({
        "node": state.hub.node(),
        "hub": state.hub.stats(),
        "cluster": {
            "version": membership.version(),
            "nodes": nodes,
        },
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let config = WebSocketConfig {
        max_message_size: state.config.limits.max_message_size,
    };
    ws.on_upgrade(move |socket| {
        let conn = WebSocketConnection::new(socket, Some(remote), &config);
        pump::serve_connection(state, Box::new(conn))
    })
}
