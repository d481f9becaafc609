//! Error types for the server runtime.

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while managing an HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material missing or unparseable.
    #[error("tls error: {0}")]
    Tls(String),

    /// Binding the listener failed.
    #[error("listen on {addr} failed: {source}")]
    Listen {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying bind error.
        source: std::io::Error,
    },

    /// HTTP/3 endpoint setup failed.
    #[error("http3 error: {0}")]
    Http3(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
