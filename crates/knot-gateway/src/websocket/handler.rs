//! WebSocket upgrade and per-connection task.
//!
//! `GET /?tid=<team>&uid=<user>` (also served at `/ws`). Both parameters are
//! required and must be non-empty; otherwise the request is answered with
//! `400 Bad Request` and no session is created.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{Extensions, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use futures::stream::SplitStream;
use knot_core::{ConnectionId, HandshakeError, TeamId, UserId};
use metrics::{counter, gauge};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::registry::Registry;
use crate::server::AppState;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::WsConnection;

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HandshakeParams {
    /// Team identifier.
    pub tid: Option<String>,
    /// User identifier.
    pub uid: Option<String>,
}

impl HandshakeParams {
    /// Extract non-empty team and user identifiers.
    pub fn validate(&self) -> Result<(TeamId, UserId), HandshakeError> {
        let team = non_empty(self.tid.as_deref()).ok_or(HandshakeError::MissingTeam)?;
        let user = non_empty(self.uid.as_deref()).ok_or(HandshakeError::MissingUser)?;
        Ok((TeamId::from(team), UserId::from(user)))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// GET / and GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    extensions: Extensions,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let (team_id, user_id) = match params.validate() {
        Ok(ids) => ids,
        Err(err) => {
            counter!(crate::metrics::WS_HANDSHAKE_REJECTIONS_TOTAL).increment(1);
            warn!(error = %err, "rejecting websocket handshake");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    upgrade
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, team_id, user_id, remote_addr, state))
}

#[instrument(skip_all, fields(team_id = %team_id, user_id = %user_id))]
async fn handle_socket(
    socket: WebSocket,
    team_id: TeamId,
    user_id: UserId,
    remote_addr: Option<SocketAddr>,
    state: AppState,
) {
    let (sink, stream) = socket.split();
    let connection: Arc<dyn Connection> =
        Arc::new(WsConnection::new(ConnectionId::new(), remote_addr, sink));
    let conn_id = connection.id().clone();

    counter!(crate::metrics::WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(%conn_id, ?remote_addr, "websocket connected");

    let session = Session::new(team_id, user_id, connection, &state.session_config);
    if register(&state.registry, &state.shutdown, &session).await {
        run_session(&state.registry, session, stream).await;
    }

    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(%conn_id, "websocket disconnected");
}

/// Add `session` to the registry unless shutdown has begun. Returns
/// `false` (with the session closed and unregistered) otherwise.
///
/// The second check covers a shutdown that started while the session was
/// being added: `close_all` may already have swept the registry.
async fn register(registry: &Registry, shutdown: &ShutdownCoordinator, session: &Arc<Session>) -> bool {
    if shutdown.is_shutting_down() {
        session.close().await;
        return false;
    }
    let _ = registry.add(session.clone()).await;
    if shutdown.is_shutting_down() {
        debug!(conn_id = %session.connection_id(), "shutdown began during registration");
        let _ = registry.remove(session.connection_id()).await;
        session.close().await;
        return false;
    }
    true
}

/// Drive the delivery loop alongside the read loop, and unregister when
/// either ends.
async fn run_session(registry: &Registry, session: Arc<Session>, mut stream: SplitStream<WebSocket>) {
    let conn_id = session.connection_id().clone();

    tokio::select! {
        exit = session.clone().run() => {
            debug!(%conn_id, ?exit, "delivery loop ended");
        }
        () = read_inbound(&mut stream, &conn_id) => {
            debug!(%conn_id, "peer stopped sending");
        }
    }

    // No-op when the session already removed itself or was superseded.
    let _ = registry.remove(&conn_id).await;
    session.close().await;
}

/// Drain inbound frames until the peer closes or errors.
async fn read_inbound(stream: &mut SplitStream<WebSocket>, conn_id: &ConnectionId) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                debug!(%conn_id, len = data.len(), payload = %String::from_utf8_lossy(&data), "inbound message");
            }
            Ok(Message::Text(_)) => {
                counter!(crate::metrics::WS_PROTOCOL_VIOLATIONS_TOTAL).increment(1);
                warn!(%conn_id, "text frame received, only binary frames are accepted");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!(%conn_id, ?frame, "close frame received");
                break;
            }
            Err(err) => {
                debug!(%conn_id, error = %err, "websocket read error");
                break;
            }
        }
    }
}
