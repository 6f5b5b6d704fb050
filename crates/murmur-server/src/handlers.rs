//! Connection handlers for Murmur server.
//!
//! This module handles the HTTP surface: the WebSocket upgrade, admission
//! into the hub, and the health check.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use murmur_core::{Admission, Connection, Hub, HubHandle, PersistenceStore};
use murmur_transport::websocket::{self, CLOSE_TRY_AGAIN};
use murmur_transport::ConnectionPump;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// How often hub statistics are exported.
const STATS_PERIOD: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// Control handle of the running hub.
    pub hub: HubHandle,
    /// Store used for message persistence, if any.
    pub store: Option<Arc<dyn PersistenceStore>>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle, store: Option<Arc<dyn PersistenceStore>>) -> Self {
        Self { hub, store, config }
    }

    /// Build the store from `config`, spawn a hub over it, and wrap both.
    #[must_use]
    pub fn spawn(config: Config) -> Self {
        let store = config.build_store();
        let hub = Hub::spawn(config.hub_config(), store.clone());
        Self::new(config, hub, store)
    }
}

/// Query string accepted by the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Display name of the connecting user.
    pub username: Option<String>,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::spawn(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        } else {
            metrics::spawn_stats_reporter(state.hub.clone(), STATS_PERIOD);
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Murmur server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?username=<name>",
        addr, config.transport.websocket_path
    );
    info!(
        persistence = state.store.as_ref().map_or("none", |s| s.name()),
        max_connections = config.limits.max_connections,
        "Hub ready"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Murmur server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    let (status, clients) = match &stats {
        Ok(stats) => ("ok", stats.members),
        Err(_) => ("degraded", 0),
    };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": clients,
        "max_clients": state.config.limits.max_connections,
        "persistence": state.store.as_ref().map_or("none", |s| s.name()),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let username = match query.username.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            debug!("Upgrade refused: missing username");
            return (StatusCode::BAD_REQUEST, "username is required").into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, username, state))
}

/// Handle an upgraded WebSocket from admission to teardown.
async fn handle_websocket(socket: WebSocket, username: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (handle, queue) =
        Connection::open(username.clone(), state.config.limits.outbound_queue_capacity);
    let connection_id = handle.id();

    match state.hub.admit(handle).await {
        Ok(Admission::Accepted) => {
            debug!(connection = %connection_id, username = %username, "WebSocket admitted");
        }
        Ok(Admission::Rejected(reason)) => {
            metrics::record_rejection(reason);
            warn!(
                connection = %connection_id,
                username = %username,
                reason = %reason,
                "WebSocket refused"
            );
            if let Err(e) = websocket::refuse(socket, CLOSE_TRY_AGAIN, "server full").await {
                debug!(connection = %connection_id, error = %e, "Failed to send close frame");
            }
            return;
        }
        Err(e) => {
            metrics::record_error("hub_unavailable");
            error!(connection = %connection_id, error = %e, "Hub unavailable");
            if let Err(e) = websocket::refuse(socket, close_code::ERROR, "unavailable").await {
                debug!(connection = %connection_id, error = %e, "Failed to send close frame");
            }
            return;
        }
    }

    let (reader, writer) = websocket::split(socket);
    let teardown = ConnectionPump::new(
        username,
        queue,
        reader,
        writer,
        state.hub.clone(),
        state.config.pump_config(),
    )
    .with_store(state.store.clone())
    .run()
    .await;

    metrics::record_teardown(teardown.kind());
}
