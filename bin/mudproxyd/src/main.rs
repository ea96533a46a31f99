#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use mudproxy_core::config::{DEFAULT_MAX_BUFFER_LINES, DEFAULT_PERSISTENCE_TIMEOUT_MS};
use mudproxy_core::{ProxyConfig, SessionConfig};

/// Bridges browser WebSocket connections to a byte-oriented MUD upstream,
/// persisting the upstream connection across brief client disconnects.
#[derive(Debug, Parser)]
#[command(name = "mudproxyd", version, about)]
struct Args {
    /// Address the WebSocket transport server listens on.
    #[arg(long, env = "MUDPROXY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Scheme-tagged upstream address, e.g. `tls://mud.example.org:7443` or
    /// `tcp://mud.example.org:7777`.
    #[arg(long, env = "MUDPROXY_UPSTREAM")]
    upstream: String,

    /// Default persistence window (milliseconds) applied when a handshake
    /// carries no override.
    #[arg(long, env = "MUDPROXY_PERSISTENCE_TIMEOUT_MS", default_value_t = DEFAULT_PERSISTENCE_TIMEOUT_MS)]
    persistence_timeout_ms: u64,

    /// Default replay buffer line cap applied when a handshake carries no
    /// override.
    #[arg(long, env = "MUDPROXY_MAX_BUFFER_LINES", default_value_t = DEFAULT_MAX_BUFFER_LINES)]
    max_buffer_lines: usize,

    /// Prepend a PROXY protocol v1 header to new upstream connections.
    #[arg(long, env = "MUDPROXY_USE_PROXY_PROTOCOL")]
    use_proxy_protocol: bool,

    /// Increase log verbosity. Repeatable (`-v`, `-vv`). `RUST_LOG` always
    /// takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    mudproxy_logging::init(args.verbose);

    let config = ProxyConfig {
        listen_addr: args.listen,
        upstream_url: args.upstream,
        default_session_config: SessionConfig::from_overrides(
            Some(args.persistence_timeout_ms),
            Some(args.max_buffer_lines),
        ),
        use_proxy_protocol: args.use_proxy_protocol,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start tokio runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(mudproxy_daemon::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mudproxyd: {error}");
            ExitCode::FAILURE
        }
    }
}
