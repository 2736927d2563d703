//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registry::Registry;

/// How a bounded shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session was closed within the timeout.
    Completed {
        /// Number of sessions closed.
        sessions: usize,
    },
    /// The timeout elapsed first; closing continues in the background.
    TimedOut,
    /// The close task panicked.
    Failed,
}

/// Stops connection intake and closes every session within a bound.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the intake token. The listener stops accepting once
    /// it is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop intake and close every session, waiting at most `timeout`.
    ///
    /// 1. Cancel the intake token
    /// 2. Spawn [`Registry::close_all`]
    /// 3. Race it against `timeout`
    ///
    /// On timeout the spawned close is not aborted: sessions keep closing
    /// in the background, each bounded by its own write timeout.
    pub async fn close_sessions(&self, registry: Arc<Registry>, timeout: Duration) -> ShutdownOutcome {
        self.shutdown();
        let started = Instant::now();
        info!(
            groups = registry.count(),
            sessions = registry.session_count(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "closing sessions"
        );

        let close = tokio::spawn(async move { registry.close_all().await });

        match tokio::time::timeout(timeout, close).await {
            Ok(Ok(sessions)) => {
                info!(sessions, elapsed = ?started.elapsed(), "all sessions closed");
                ShutdownOutcome::Completed { sessions }
            }
            Ok(Err(err)) => {
                error!(error = %err, "session close task failed");
                ShutdownOutcome::Failed
            }
            Err(_) => {
                warn!("shutdown timed out after {timeout:?}, sessions still closing in background");
                ShutdownOutcome::TimedOut
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
