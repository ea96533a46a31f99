//! Session and process-wide configuration types.
//!
//! Limits are enforced wherever a [`SessionConfig`] is built from untrusted
//! input (handshake query parameters, `updateConfig` control messages):
//! out-of-range numeric values are clamped, non-numeric or absent values
//! fall back to the defaults. Construction never fails.

use serde::{Deserialize, Serialize};

/// Lower/upper bounds and hard cap from the wire contract. Bit-exact.
pub const MIN_PERSISTENCE_TIMEOUT_MS: u64 = 0;
pub const MAX_PERSISTENCE_TIMEOUT_MS: u64 = 43_200_000;
pub const MIN_MAX_BUFFER_LINES: usize = 10;
pub const MAX_MAX_BUFFER_LINES: usize = 10_000;
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_PERSISTENCE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_BUFFER_LINES: usize = 1_000;

/// Per-session limits, negotiable by the client at handshake time and via
/// `updateConfig`. Always valid: the hard buffer byte cap is not part of
/// this type because it is never configurable (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(rename = "persistenceTimeout")]
    pub persistence_timeout_ms: u64,
    #[serde(rename = "maxBufferLines")]
    pub max_buffer_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persistence_timeout_ms: DEFAULT_PERSISTENCE_TIMEOUT_MS,
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
        }
    }
}

impl SessionConfig {
    /// Builds a config from optional raw overrides, clamping in-range values
    /// and defaulting anything absent or out of range. Never fails: this is
    /// the single entry point both the handshake query parser and the
    /// `updateConfig` control message handler go through (§6, §4.7).
    #[must_use]
    pub fn from_overrides(
        persistence_timeout_ms: Option<u64>,
        max_buffer_lines: Option<usize>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            persistence_timeout_ms: persistence_timeout_ms
                .map_or(defaults.persistence_timeout_ms, clamp_persistence_timeout),
            max_buffer_lines: max_buffer_lines
                .map_or(defaults.max_buffer_lines, clamp_max_buffer_lines),
        }
    }

    /// Applies a partial update (as carried by an `updateConfig` control
    /// message), clamping whichever fields are present and leaving the rest
    /// untouched.
    pub fn apply_update(&mut self, persistence_timeout_ms: Option<u64>, max_buffer_lines: Option<u64>) {
        if let Some(ms) = persistence_timeout_ms {
            self.persistence_timeout_ms = clamp_persistence_timeout(ms);
        }
        if let Some(lines) = max_buffer_lines {
            self.max_buffer_lines = clamp_max_buffer_lines(lines as usize);
        }
    }
}

fn clamp_persistence_timeout(value: u64) -> u64 {
    value.clamp(MIN_PERSISTENCE_TIMEOUT_MS, MAX_PERSISTENCE_TIMEOUT_MS)
}

fn clamp_max_buffer_lines(value: usize) -> usize {
    value.clamp(MIN_MAX_BUFFER_LINES, MAX_MAX_BUFFER_LINES)
}

/// Process-wide configuration, assembled once at startup from CLI flags
/// layered over environment variables (see `SPEC_FULL.md` §1.3).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the transport server listens on.
    pub listen_addr: std::net::SocketAddr,
    /// Scheme-tagged upstream address, e.g. `tls://mud.example.org:7443`.
    pub upstream_url: String,
    /// Default `SessionConfig` applied when a handshake carries no override.
    pub default_session_config: SessionConfig,
    /// Whether to prepend a PROXY protocol v1 header to new upstream
    /// connections.
    pub use_proxy_protocol: bool,
}
