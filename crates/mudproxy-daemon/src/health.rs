//! Operational HTTP endpoints: `/health` and `/stats` (§6, informative).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use mudproxy_core::SessionConfig;
use mudproxy_session::SessionState;

use crate::state::AppState;

/// Liveness response body for `/health`.
#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
}

/// Always reports healthy once the server is accepting connections; there
/// is no deeper dependency (e.g. a database) to probe.
pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// Response body for `/stats`.
#[derive(Debug, Serialize)]
pub struct Stats {
    active_sessions: usize,
    persisting_sessions: usize,
    default_session_config: SessionConfig,
}

/// Reports counts of active vs. persisting sessions and the effective
/// default config, for operational visibility. Not part of the core
/// contract (§6).
pub async fn stats(State(state): State<AppState>) -> Json<Stats> {
    let mut active_sessions = 0;
    let mut persisting_sessions = 0;
    for session in state.registry.iter() {
        match session.state().await {
            SessionState::Active => active_sessions += 1,
            SessionState::Persisting => persisting_sessions += 1,
            SessionState::DoomedNoUpstream | SessionState::DoomedExpired => {}
        }
    }
    Json(Stats {
        active_sessions,
        persisting_sessions,
        default_session_config: state.config.default_session_config,
    })
}
