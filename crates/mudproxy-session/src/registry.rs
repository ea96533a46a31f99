//! Session Registry (C4, `spec.md` §4.4).

use std::sync::Arc;

use dashmap::DashMap;

use mudproxy_core::SessionId;

use crate::id::{generate_session_id, MAX_ID_COLLISION_RETRIES};
use crate::session::Session;

/// Errors raised while creating a registry entry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Every generated candidate id collided with an existing session
    /// within [`MAX_ID_COLLISION_RETRIES`] attempts.
    #[error("could not allocate a unique session id after {0} attempts")]
    IdSpaceExhausted(usize),
}

/// In-memory `id -> Session` map (§4.4). Concurrent lookups from accept
/// paths are lock-free via [`DashMap`]'s internal sharding; creation and
/// removal are likewise safe to call from any task without an external
/// lock. Each [`Session`]'s own fields are independently protected, so the
/// registry only ever hands out `Arc<Session>` and never reaches into a
/// session's internals itself (`spec.md` §9).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh session id guaranteed not to collide with an existing
    /// entry, retrying up to [`MAX_ID_COLLISION_RETRIES`] times.
    pub fn allocate_id(&self) -> Result<SessionId, RegistryError> {
        for _ in 0..MAX_ID_COLLISION_RETRIES {
            let candidate = generate_session_id();
            if !self.sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::IdSpaceExhausted(MAX_ID_COLLISION_RETRIES))
    }

    /// Registers `session` under its own id. Overwrites a prior entry with
    /// the same id, which should never happen in practice since ids are
    /// drawn via [`Self::allocate_id`].
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Looks up a session by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a session from the registry. Idempotent: removing an id that
    /// is not present is a no-op (§4.5 "cleanup is idempotent").
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Number of sessions currently registered (active or persisting).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every currently registered session, for iteration during
    /// shutdown or `/stats`.
    pub fn iter(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudproxy_core::SessionConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn dummy_session(id: &str) -> Arc<Session> {
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let (upstream_tx, _upstream_rx) = mpsc::unbounded_channel();
        Arc::new(Session::new(
            id.to_string(),
            SessionConfig::default(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            0,
            client_tx,
            upstream_tx,
        ))
    }

    #[test]
    fn insert_then_get_round_trips() {
        let registry = SessionRegistry::new();
        registry.insert(dummy_session("abc123"));
        assert!(registry.get("abc123").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.insert(dummy_session("abc123"));
        registry.remove("abc123");
        registry.remove("abc123");
        assert!(registry.get("abc123").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn allocate_id_avoids_existing_entries() {
        let registry = SessionRegistry::new();
        let id = registry.allocate_id().unwrap();
        registry.insert(dummy_session(&id));
        let other = registry.allocate_id().unwrap();
        assert_ne!(id, other);
    }

    #[test]
    fn iter_reflects_current_contents() {
        let registry = SessionRegistry::new();
        registry.insert(dummy_session("a"));
        registry.insert(dummy_session("b"));
        assert_eq!(registry.iter().len(), 2);
    }
}
