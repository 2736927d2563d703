//! Transport boundary.
//!
//! The core never touches sockets directly. The WebSocket adapter in
//! [`crate::websocket::connection`] implements this trait for real peers;
//! [`crate::testing::RecordingConnection`] implements it in memory.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use knot_core::{ConnectionId, TransportError};

/// An open duplex connection to one peer.
///
/// Implementations must tolerate `send_close` and `close` being called on an
/// already closed connection (returning an error is fine, panicking is not).
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Stable identifier of this connection.
    fn id(&self) -> &ConnectionId;

    /// Remote peer address, if the transport knows it.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Write one binary payload to the peer.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Send a close notification frame.
    async fn send_close(&self) -> Result<(), TransportError>;

    /// Shut the connection down.
    async fn close(&self) -> Result<(), TransportError>;
}
