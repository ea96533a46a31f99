#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `mudproxy-session` owns everything `spec.md` attributes to C2 (Bounded
//! Replay Buffer), C4 (Session Registry), and C5 (Session state machine):
//! the FIFO buffer with its line-count/byte-size eviction, 24-character
//! session id generation with collision retry, the concurrent registry
//! mapping id to session, and the session state machine that composes the
//! buffer with the Terminal Negotiation Filter from `mudproxy-filter`.
//!
//! # Design
//!
//! A [`session::Session`] never owns a raw socket. It holds
//! `UnboundedSender<Vec<u8>>` handles to the tasks in `mudproxy-daemon` and
//! `mudproxy-net` that actually own the client transport and upstream
//! connection, and mutates its bookkeeping fields under its own lock. This
//! sidesteps the ownership-cycle concern `spec.md` §9 raises about the
//! source's event-emitter wiring: a session is looked up by id through
//! [`registry::SessionRegistry`], acted on, and dropped, with no object
//! holding a reference back to anything that outlives it.
//!
//! # Invariants
//!
//! - [`session::Session::detach_client`] and
//!   [`session::Session::attach_client`] are the only places the
//!   persistence-timer generation counter changes, which is what makes
//!   [`session::Session::try_expire`] race-safe (§5).
//! - [`registry::SessionRegistry::remove`] is idempotent (P8).

/// Bounded FIFO replay buffer (C2).
pub mod buffer;
/// Session id generation.
pub mod id;
/// In-memory session registry (C4).
pub mod registry;
/// Session state machine (C5).
pub mod session;

pub use buffer::ReplayBuffer;
pub use id::generate_session_id;
pub use registry::{RegistryError, SessionRegistry};
pub use session::{AttachOutcome, DetachAction, Session, SessionState};
