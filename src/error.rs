//! Error types for the daemon.
//!
//! Per-connection failures never surface here: the request pipeline maps
//! them onto fixed HTTP responses. `DaemonError` covers what stops the
//! daemon from serving at all.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Failures raised while constructing, configuring or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon was built without a query handler.
    #[error("query handler is missing")]
    MissingHandler,

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine thread could not be started.
    #[error("failed to start engine thread: {0}")]
    Thread(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
