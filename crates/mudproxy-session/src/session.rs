//! Session state machine (C5, `spec.md` §4.5).

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use mudproxy_core::{BufferedMessage, SessionConfig, SessionId};
use mudproxy_filter::TerminalFilter;

use crate::buffer::ReplayBuffer;

/// Outcome of [`Session::detach_client`], telling the caller what scheduling
/// action it must now take. The session's own lock is released before the
/// caller acts on this, so arming a timer means spawning a `tokio::time`
/// sleep tagged with `generation` that calls [`Session::try_expire`] when it
/// wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachAction {
    /// Upstream was already dead, the close was graceful, or
    /// `persistence_timeout_ms == 0`: remove the session now.
    CleanupNow,
    /// Arm a persistence timer for `duration`, tagged with `generation`; a
    /// timer callback should call [`Session::try_expire`] with the same
    /// generation after sleeping.
    ArmTimer { duration: Duration, generation: u64 },
}

/// Outcome of attaching a client transport, fresh or reattaching.
#[derive(Debug)]
pub struct AttachOutcome {
    /// Buffered messages to drain to the client, in order, after any
    /// `reconnected` control message has been sent.
    pub buffered: Vec<BufferedMessage>,
    /// `true` if the client's address differed from the last attachment
    /// (only meaningful on reattach; always `false` on first attach).
    pub ip_changed: bool,
}

/// The coarse state of a session per the truth table in §4.5. Sessions in
/// `DoomedNoUpstream`/`DoomedExpired` are terminal and expected to be
/// removed from the registry within one scheduling tick; this enum exists
/// for diagnostics (`/stats`) and the state-machine tests (P7), not as a
/// long-lived stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `has_client && upstream_alive`, no timer set.
    Active,
    /// No client, upstream alive, persistence timer armed.
    Persisting,
    /// Upstream is gone; the session must be cleaned up.
    DoomedNoUpstream,
    /// The persistence timer fired; the session must be cleaned up.
    DoomedExpired,
}

#[derive(Debug)]
struct Inner {
    config: SessionConfig,
    buffer: ReplayBuffer,
    filter: TerminalFilter,
    client_ip: IpAddr,
    client_port: u16,
    created_at: Instant,
    disconnected_at: Option<Instant>,
    client_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    upstream_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    upstream_alive: bool,
    /// Bumped on every attach/detach so a stale timer callback can recognize
    /// it has been superseded (race-safe cancellation, §5).
    timer_generation: u64,
    expired: bool,
}

/// Ties one upstream connection to zero-or-one attached client transport
/// (§3, §C5). All mutable fields live behind `inner`'s lock, so concurrent
/// handlers for the *same* session serialize while independent sessions
/// never contend (§5). Neither leg's actual socket lives here: the session
/// only holds channels to the tasks that own them, per the "dereference by
/// id, wire through message passing" guidance in `spec.md` §9.
#[derive(Debug)]
pub struct Session {
    /// The session's opaque, registry-unique identifier.
    pub id: SessionId,
    inner: Mutex<Inner>,
}

impl Session {
    /// Constructs a freshly created, attached (`ACTIVE`) session.
    #[must_use]
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        client_ip: IpAddr,
        client_port: u16,
        client_tx: mpsc::UnboundedSender<Vec<u8>>,
        upstream_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                config,
                buffer: ReplayBuffer::new(),
                filter: TerminalFilter::new(),
                client_ip,
                client_port,
                created_at: Instant::now(),
                disconnected_at: None,
                client_tx: Some(client_tx),
                upstream_tx: Some(upstream_tx),
                upstream_alive: true,
                timer_generation: 0,
                expired: false,
            }),
        }
    }

    /// Current effective [`SessionConfig`].
    pub async fn config(&self) -> SessionConfig {
        self.inner.lock().await.config
    }

    /// How long the session has existed.
    pub async fn age(&self) -> Duration {
        self.inner.lock().await.created_at.elapsed()
    }

    /// The coarse observable state, per the §4.5 truth table.
    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        if !inner.upstream_alive {
            SessionState::DoomedNoUpstream
        } else if inner.expired {
            SessionState::DoomedExpired
        } else if inner.client_tx.is_some() {
            SessionState::Active
        } else {
            SessionState::Persisting
        }
    }

    /// Whether a client transport is currently attached.
    pub async fn has_client(&self) -> bool {
        self.inner.lock().await.client_tx.is_some()
    }

    /// Applies a partial config update from an `updateConfig` control
    /// message (§4.7), clamping to the published limits, and returns the
    /// resulting config to ack with `configUpdated`. A currently-running
    /// persistence timer is not rearmed by this call (§4.7).
    pub async fn update_config(
        &self,
        persistence_timeout_ms: Option<u64>,
        max_buffer_lines: Option<u64>,
    ) -> SessionConfig {
        let mut inner = self.inner.lock().await;
        inner
            .config
            .apply_update(persistence_timeout_ms, max_buffer_lines);
        inner.config
    }

    /// Attaches `client_tx` as the session's new client transport, either on
    /// first creation or on reattach. Cancels any pending persistence timer
    /// by bumping the generation counter, clears the expiry flag, and if the
    /// client's address changed since the last attachment and the filter
    /// had already negotiated `NEW_ENVIRON`, writes the unsolicited
    /// `NEW_ENVIRON INFO` update upstream before returning (§4.1, §4.5).
    ///
    /// The caller is expected to send a `session`/`reconnected` control
    /// message using `outcome.buffered.len()` and then forward
    /// `outcome.buffered` to the client, in that order (§4.6 step 3).
    pub async fn attach_client(
        &self,
        client_tx: mpsc::UnboundedSender<Vec<u8>>,
        ip: IpAddr,
        port: u16,
    ) -> AttachOutcome {
        let mut inner = self.inner.lock().await;
        inner.timer_generation += 1;
        inner.disconnected_at = None;
        inner.expired = false;
        let ip_changed = inner.client_ip != ip;
        inner.client_ip = ip;
        inner.client_port = port;
        inner.client_tx = Some(client_tx);

        if ip_changed {
            if let Some(announcement) = inner.filter.build_ip_change_announcement(&ip.to_string()) {
                if let Some(tx) = &inner.upstream_tx {
                    let _ = tx.send(announcement);
                }
            }
        }

        let buffered = inner.buffer.drain();
        AttachOutcome { buffered, ip_changed }
    }

    /// Detaches the client transport. `graceful` reflects whether the
    /// transport closed with the normal-closure status code (§4.5
    /// "Intent"). Returns the action the caller must now take.
    pub async fn detach_client(&self, graceful: bool) -> DetachAction {
        let mut inner = self.inner.lock().await;
        inner.client_tx = None;
        inner.disconnected_at = Some(Instant::now());
        inner.timer_generation += 1;
        let generation = inner.timer_generation;

        if graceful || !inner.upstream_alive || inner.config.persistence_timeout_ms == 0 {
            return DetachAction::CleanupNow;
        }

        DetachAction::ArmTimer {
            duration: Duration::from_millis(inner.config.persistence_timeout_ms),
            generation,
        }
    }

    /// Called by a persistence timer after sleeping for the duration given
    /// in its [`DetachAction::ArmTimer`]. Returns `true` only if `generation`
    /// still matches the session's current generation and no client has
    /// reattached in the meantime, in which case the session is marked
    /// expired and the caller must clean it up. Race-safe: a reattach bumps
    /// the generation before this can observe a stale one (§5).
    pub async fn try_expire(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.client_tx.is_none() && inner.timer_generation == generation {
            inner.expired = true;
            true
        } else {
            false
        }
    }

    /// Marks the upstream connection as closed. Returns `true` if a client
    /// was attached (the caller must close that transport with a
    /// normal-closure status, §4.5 "upstream closes"), after which the
    /// caller must clean up the session unconditionally.
    pub async fn mark_upstream_closed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.upstream_alive = false;
        inner.upstream_tx = None;
        inner.client_tx.is_some()
    }

    /// Processes one chunk of bytes read from the upstream socket: runs it
    /// through the Terminal Negotiation Filter (C1), writes any negotiation
    /// reply upstream, and forwards the remaining bytes to the attached
    /// client or, if absent, appends them to the replay buffer (C2). This is
    /// the composition the Session (C5) is responsible for per §2.
    pub async fn push_upstream_data(&self, chunk: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        let client_ip = inner.client_ip.to_string();
        let outcome = inner.filter.process(&chunk, &client_ip);

        if !outcome.to_upstream.is_empty() {
            if let Some(tx) = &inner.upstream_tx {
                let _ = tx.send(outcome.to_upstream);
            }
        }

        if !outcome.to_client.is_empty() {
            if let Some(tx) = &inner.client_tx {
                let _ = tx.send(outcome.to_client);
            } else {
                let max_lines = inner.config.max_buffer_lines;
                let id = self.id.clone();
                if !inner.buffer.append(outcome.to_client, max_lines) {
                    warn!(session_id = %id, "dropping oversized upstream chunk (BufferOverrun)");
                }
            }
        }
    }

    /// Sends `frame` directly to the attached client transport, if any.
    /// Used by the transport server to deliver control-message acks (e.g.
    /// `configUpdated`) that the session itself has no opinion on.
    pub async fn send_to_client(&self, frame: Vec<u8>) {
        let inner = self.inner.lock().await;
        if let Some(tx) = &inner.client_tx {
            let _ = tx.send(frame);
        }
    }

    /// Forwards client-originated bytes (already classified as opaque
    /// payload, not a control message) to the upstream socket, if alive.
    pub async fn push_client_data(&self, data: Vec<u8>) {
        let inner = self.inner.lock().await;
        if let Some(tx) = &inner.upstream_tx {
            let _ = tx.send(data);
        }
    }
}
