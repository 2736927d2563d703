//! Prometheus recorder installation and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants shared by the gateway modules.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrade requests rejected for missing `tid`/`uid` (counter).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Inbound text frames (counter).
pub const WS_PROTOCOL_VIOLATIONS_TOTAL: &str = "ws_protocol_violations_total";
/// Sessions ended by a failed or timed out write (counter).
pub const SESSION_WRITE_FAILURES_TOTAL: &str = "session_write_failures_total";
/// Payloads rejected by a full session queue (counter).
pub const SESSION_MESSAGES_DROPPED_TOTAL: &str = "session_messages_dropped_total";
/// Broadcast ticks run (counter).
pub const BROADCAST_TICKS_TOTAL: &str = "broadcast_ticks_total";
/// Broadcast payloads enqueued (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "broadcast_deliveries_total";
/// Live groups (gauge).
pub const GROUPS_ACTIVE: &str = "groups_active";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
