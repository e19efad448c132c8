//! plan-sync agent: keeps one plan's channels connected and exposes the
//! session state over HTTP.

use anyhow::Context;
use axum::{
    extract::State,
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use plan_sync::channel::{ConnectionState, WebSocketConnector};
use plan_sync::{HttpBaseline, PlanSession, SyncConfig};

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    plan_id: Option<i64>,
    connected_channels: usize,
    pending_edits: usize,
    uptime_seconds: u64,
}

/// Health check endpoint
async fn health_check(State(session): State<Arc<PlanSession>>) -> impl IntoResponse {
    let snapshot = session.snapshot();
    let connected = snapshot
        .channels
        .iter()
        .filter(|c| c.state == ConnectionState::Connected)
        .count();

    Json(HealthResponse {
        status: if connected == snapshot.channels.len() {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        plan_id: snapshot.plan_id,
        connected_channels: connected,
        pending_edits: snapshot.pending,
        uptime_seconds: snapshot.uptime_seconds,
    })
}

/// Full session snapshot: channel states and store contents
async fn session_state(State(session): State<Arc<PlanSession>>) -> impl IntoResponse {
    Json(session.snapshot())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plan_sync=info,tower_http=info".into()),
        )
        .init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let port = config.status_port;

    let baseline = HttpBaseline::new(&config.api_url).context("failed to build HTTP client")?;
    let session = Arc::new(PlanSession::new(
        config,
        Arc::new(WebSocketConnector::new()),
        Arc::new(baseline),
    ));

    // Start background tasks
    let background_handles = session.clone().start_background_tasks();
    session.activate();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/session", get(session_state))
        .with_state(session.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("plan-sync agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Broker: {}", session.config().ws_url);
    info!("   Plan: {:?}", session.plan_id());
    info!("   Status: http://{}/api/session", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    session.shutdown().await;
    background_handles.wait().await;
    info!("plan-sync agent stopped");
    Ok(())
}
