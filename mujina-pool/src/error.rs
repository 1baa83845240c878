//! Error types for the pool client and job pipeline.
//!
//! Per-connection errors are absorbed by the connection task, which logs them
//! and reconnects after a backoff. The watchdog error is the only one that is
//! meant to take the process down.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed JSON-RPC line or a message missing required fields.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("could not resolve {host}")]
    DnsResolutionFailed { host: String },

    #[error("connect to {addr} failed: {source}")]
    SocketConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No line was received within the read timeout.
    #[error("socket read timed out")]
    SocketTimeout,

    #[error("socket closed by peer")]
    SocketClosedByPeer,

    /// A `mining.notify` carried more merkle branches than a job can hold.
    #[error("too many merkle branches: {0}")]
    TooManyMerkleBranches(usize),

    #[error("TLS endpoints are not supported ({host})")]
    TlsUnsupported { host: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Neither pool answered a share submission for too long.
    #[error("no submit response for {silent_for:?}")]
    Watchdog { silent_for: Duration },
}

impl Error {
    /// Whether this error ends the current pool session.
    ///
    /// All of these lead to the same recovery: close the socket, drop the
    /// pool's jobs, report the disconnect and retry after the backoff.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolParse(_)
                | Error::SocketConnectFailed { .. }
                | Error::SocketTimeout
                | Error::SocketClosedByPeer
                | Error::TlsUnsupported { .. }
                | Error::Io(_)
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
