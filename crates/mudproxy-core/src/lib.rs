#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `mudproxy-core` holds the data model and control-plane wire types shared
//! by every other crate in the workspace: [`config::SessionConfig`] and
//! [`config::ProxyConfig`] (§3), the [`control`] message enums exchanged
//! over the client transport (§4.7), and the small value types
//! ([`model::BufferedMessage`], [`model::ClientAddr`], [`model::SessionId`])
//! that the session, net, and daemon crates build on.
//!
//! # Design
//!
//! Nothing in this crate touches I/O. It exists so that the wire contract
//! (field names, clamping rules, frame layout) has exactly one definition
//! that `mudproxy-session`, `mudproxy-net`, and `mudproxy-daemon` all
//! depend on, instead of each layer re-deriving it.
//!
//! # Invariants
//!
//! - [`config::SessionConfig`] construction never fails: out-of-range
//!   values are clamped, not rejected (§6).
//! - [`control::classify_frame`] and [`control::encode_server_message`] are
//!   the only place the `0x00` control-prefix convention is encoded; all
//!   other crates call into them rather than re-checking the leading byte.

/// Per-session and process-wide configuration limits.
pub mod config;
/// Control-plane message types and frame classification.
pub mod control;
/// Shared value types: buffered messages, client addresses, session ids.
pub mod model;

pub use config::{ProxyConfig, SessionConfig};
pub use control::{ClientControlMessage, FrameKind, ServerControlMessage};
pub use model::{BufferedMessage, ClientAddr, SessionId};
