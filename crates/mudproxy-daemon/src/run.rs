//! Router assembly and the top-level `run` entry point.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use mudproxy_core::ProxyConfig;

use crate::error::DaemonError;
use crate::health::{health, stats};
use crate::state::AppState;
use crate::ws::ws_upgrade;

/// Builds the axum router: `/ws` for the bridge itself, `/health` and
/// `/stats` for operational visibility (§6).
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Binds `config.listen_addr` and serves until a shutdown signal arrives,
/// at which point every live session is torn down (§4.6 "Shutdown").
pub async fn run(config: ProxyConfig) -> Result<(), DaemonError> {
    let listen_addr = config.listen_addr;
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(listen_addr).await.map_err(DaemonError::Bind)?;
    info!(%listen_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .map_err(DaemonError::Serve)
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("installing Ctrl+C handler failed");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutting down, tearing down live sessions");
    for session in state.registry.iter() {
        state.cleanup_session(&session.id);
    }
}
