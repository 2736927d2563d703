//! [`Connection`] over an axum WebSocket sink.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use knot_core::{ConnectionId, TransportError};
use tokio::sync::Mutex;

use crate::connection::Connection;

/// Write half of an upgraded WebSocket.
///
/// The read half stays with the handler task. Outbound frames are always
/// binary.
pub struct WsConnection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsConnection {
    /// Wrap the write half of a split socket.
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        sink: SplitSink<WebSocket, Message>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(payload))
            .await
            .map_err(TransportError::io)
    }

    async fn send_close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(TransportError::io)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(TransportError::io)
    }
}
