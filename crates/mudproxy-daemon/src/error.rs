//! Daemon-level startup errors.

/// Errors that can prevent the transport server from starting.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Binding the listening socket failed.
    #[error("binding listener: {0}")]
    Bind(#[source] std::io::Error),
    /// Serving HTTP connections failed.
    #[error("serving http: {0}")]
    Serve(#[source] std::io::Error),
}
