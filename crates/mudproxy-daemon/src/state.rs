//! Process-wide state shared across every `/ws` connection.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use mudproxy_core::{ProxyConfig, SessionId};
use mudproxy_session::SessionRegistry;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide configuration, fixed at startup.
    pub config: Arc<ProxyConfig>,
    /// The session registry (C4).
    pub registry: Arc<SessionRegistry>,
    /// Per-session lifetime tokens. Cancelling a session's token stops its
    /// upstream I/O tasks and, transitively (via `child_token`), any
    /// currently attached client connection's writer task.
    pub tokens: Arc<DashMap<SessionId, CancellationToken>>,
}

impl AppState {
    /// Builds fresh, empty shared state around a process configuration.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Tears a session down: cancels its lifetime token and removes it from
    /// the registry. Idempotent (P8) — a second call on an already-removed
    /// id is a no-op.
    pub fn cleanup_session(&self, id: &str) {
        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }
        self.registry.remove(id);
    }
}
