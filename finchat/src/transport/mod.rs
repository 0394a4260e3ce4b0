//! Transport layer for `FinChat`.
//!
//! One [`ws::WsConn`] wraps one physical WebSocket connection. The
//! transport knows nothing about chat semantics beyond the authentication
//! handshake performed at connect time; everything above it speaks typed
//! envelopes through the codec.

pub mod ws;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server unreachable")]
    Unreachable,

    /// The server refused the authentication handshake. Not retryable
    /// with the same token.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure should be retried via backoff. Handshake
    /// rejection is the one terminal case: the token is bad, not the
    /// network.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::HandshakeRejected(_))
    }
}

/// Raw events surfaced by a connection's background reader task.
#[derive(Debug)]
pub enum ConnEvent {
    /// A text frame arrived.
    Frame(String),
    /// A pong answering our liveness probe arrived.
    Pong,
    /// The connection closed (server close frame, read error, or EOF).
    Closed(Option<String>),
}
