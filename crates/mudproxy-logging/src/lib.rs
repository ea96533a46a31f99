#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! Maps the CLI's repeatable `-v` flag to a [`tracing_subscriber::EnvFilter`]
//! and installs the process-wide subscriber. `RUST_LOG` always takes
//! precedence when set, so an operator can reach for per-target filtering
//! without recompiling.
//!
//! # Design
//!
//! The proxy never logs application payload bytes at `info` level or above
//! (`spec.md` §1 Non-goals: the proxy does not interpret or cache payload);
//! per-session spans carry only the session id, not buffer contents, so
//! turning up verbosity widens *what* is logged about the state machine,
//! never the bytes flowing through it.

use tracing_subscriber::EnvFilter;

/// Maps a `-v` repeat count to a default filter directive, overridden
/// wholesale by `RUST_LOG` when present.
#[must_use]
pub fn verbosity_to_directive(verbose_count: u8) -> &'static str {
    match verbose_count {
        0 => "mudproxyd=info",
        1 => "mudproxyd=debug,mudproxy_session=debug,mudproxy_net=debug,mudproxy_filter=debug",
        _ => "trace",
    }
}

/// Installs the global `tracing` subscriber. Call once, at process start.
pub fn init(verbose_count: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_to_directive(verbose_count)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
