//! Settings types for every gateway subsystem.
//!
//! All structs use `#[serde(default)]` so a partial user file only needs to
//! name the values it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object, the shape of `~/.knot/settings.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-session delivery settings.
    pub session: SessionSettings,
    /// Periodic per-team broadcast settings.
    pub broadcast: BroadcastSettings,
    /// Graceful shutdown settings.
    pub shutdown: ShutdownSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject values that would make the gateway misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.session.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "session.queueCapacity must be > 0".into(),
            ));
        }
        if self.session.write_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.writeTimeoutMs must be > 0".into(),
            ));
        }
        if self.broadcast.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "broadcast.intervalMs must be > 0".into(),
            ));
        }
        if self.shutdown.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "shutdown.timeoutMs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Per-session delivery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Capacity of the bounded outbound queue.
    pub queue_capacity: usize,
    /// Deadline for a single write to the peer, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            write_timeout_ms: 5_000,
        }
    }
}

/// Periodic per-team broadcast settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Whether a broadcaster is started for each team.
    pub enabled: bool,
    /// Tick interval in milliseconds.
    pub interval_ms: u64,
    /// Payload sent to every member on each tick.
    pub payload: String,
    /// Per-member wait for queue capacity. `None` skips full queues at once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            payload: "hello".to_string(),
            send_timeout_ms: None,
        }
    }
}

/// Graceful shutdown settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// How long shutdown waits for sessions to close, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `tracing` filter directive, e.g. `"info"` or `"knot_gateway=debug"`.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
