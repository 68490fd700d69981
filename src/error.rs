//! Error types shared across the proxy.
//!
//! Channel-scoped failures (`Protocol`, `Io`, `ConnectionClosed`) close the
//! offending connection and its relay peer; they never escalate past the
//! session. `Handshake` aborts the session under construction. `Config` is
//! fatal at startup, before any socket is opened.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame on the wire (e.g. a length header below the minimum).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection. Orderly closure is not itself a
    /// failure, but it ends the session.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The backend rejected the login or sent a malformed greeting/response.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Invalid or unresolvable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level read/write failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
