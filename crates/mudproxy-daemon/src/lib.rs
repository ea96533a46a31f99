#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `mudproxy-daemon` is the transport server: it terminates client
//! WebSocket connections, dispatches handshakes to new-or-existing
//! sessions (§4.6), and owns the upstream TCP/TLS I/O tasks a session's
//! lifetime spans across reconnects (§4.7, §4.2).
//!
//! # Design
//!
//! Every other crate in the workspace is I/O-agnostic or owns exactly one
//! side of a connection; this crate is where both sides meet. It never
//! duplicates session state — [`mudproxy_session::Session`] remains the
//! single place that decides what happens to a chunk of upstream or
//! client data — and never holds a raw socket itself: reader/writer tasks
//! own the socket halves and talk to the session through channels,
//! matching the ownership pattern the session crate documents.
//!
//! # Invariants
//!
//! - A session's lifetime [`tokio_util::sync::CancellationToken`] outlives
//!   any individual WebSocket connection attached to it; cancelling it
//!   (upstream close, process shutdown) transitively cancels the attached
//!   connection's writer task via `child_token`.
//! - [`state::AppState::cleanup_session`] is the only place a session
//!   leaves the registry, and is idempotent.

/// Daemon-level startup errors.
pub mod error;
/// Handshake query parsing and client address extraction.
pub mod handshake;
/// Operational `/health` and `/stats` endpoints.
pub mod health;
/// Router assembly and the top-level `run` entry point.
pub mod run;
/// Process-wide shared state.
pub mod state;
/// Per-connection WebSocket handling.
pub mod ws;

pub use error::DaemonError;
pub use run::{build_router, run};
pub use state::AppState;
