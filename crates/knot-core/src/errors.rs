//! Error hierarchy for the knot gateway.
//!
//! - [`HandshakeError`]: connection intake rejected before any session exists
//! - [`TransportError`]: a single connection failed to write or close
//! - [`SendError`]: a payload could not be enqueued on a session
//! - [`GatewayError`]: top-level enum wrapping all of the above
//!
//! Every failure is local to the session or group it happened in; none of
//! these types carry enough context to affect sibling sessions.

use thiserror::Error;

/// Rejection of a connection attempt during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The team identifier was absent or empty.
    #[error("missing team id (tid)")]
    MissingTeam,
    /// The user identifier was absent or empty.
    #[error("missing user id (uid)")]
    MissingUser,
}

/// Failure of a single transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
    /// Any other I/O or protocol failure.
    #[error("transport error: {0}")]
    Io(String),
}

impl TransportError {
    /// Wrap an arbitrary error as [`TransportError::Io`].
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }
}

/// Failure to enqueue a payload on a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The bounded queue is full; the payload was not enqueued.
    #[error("outbound queue full")]
    QueueFull,
    /// The session is closed and accepts no more payloads.
    #[error("session closed")]
    Closed,
}

/// Top-level error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Transport failure on one connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Enqueue failure on one session.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Listener or filesystem I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
