//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Number of live team groups.
    pub teams: usize,
    /// Number of registered sessions.
    pub sessions: usize,
    /// RFC 3339 time of the check.
    pub timestamp: String,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, teams: usize, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        teams,
        sessions,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}
