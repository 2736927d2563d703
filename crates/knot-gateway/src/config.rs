//! Runtime configuration for the gateway components.
//!
//! These are the resolved, typed forms of [`knot_settings::GatewaySettings`]
//! (durations instead of millisecond integers).

use std::time::Duration;

use bytes::Bytes;
use knot_core::GatewayError;
use knot_settings::GatewaySettings;
use serde::{Deserialize, Serialize};

/// Default outbound queue capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// Default deadline for one write to a peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default broadcast interval.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(10);

/// Listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 1024 * 1024,
        }
    }
}

impl From<&GatewaySettings> for ServerConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
        }
    }
}

/// Per-session delivery configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Capacity of the bounded outbound queue (at least 1).
    pub queue_capacity: usize,
    /// Deadline for each write, close notification and close.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl From<&GatewaySettings> for SessionConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            queue_capacity: settings.session.queue_capacity.max(1),
            write_timeout: Duration::from_millis(settings.session.write_timeout_ms),
        }
    }
}

/// Periodic per-team broadcast configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Time between ticks; the first tick fires one interval after start.
    pub interval: Duration,
    /// Payload delivered to every member on each tick.
    pub payload: Bytes,
    /// Per-member wait for queue capacity. `None` skips a full queue at once.
    pub send_timeout: Option<Duration>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BROADCAST_INTERVAL,
            payload: Bytes::from_static(b"hello"),
            send_timeout: None,
        }
    }
}

impl BroadcastConfig {
    /// Broadcast config from settings, or `None` when broadcasting is disabled.
    pub fn from_settings(settings: &GatewaySettings) -> Option<Self> {
        let broadcast = &settings.broadcast;
        broadcast.enabled.then(|| Self {
            interval: Duration::from_millis(broadcast.interval_ms),
            payload: Bytes::from(broadcast.payload.clone()),
            send_timeout: broadcast.send_timeout_ms.map(Duration::from_millis),
        })
    }

    /// Reject a zero interval, which the tick timer cannot run with.
    pub fn validate(&self) -> knot_core::Result<()> {
        if self.interval.is_zero() {
            return Err(GatewayError::Config("broadcast interval must be > 0".into()));
        }
        Ok(())
    }
}
