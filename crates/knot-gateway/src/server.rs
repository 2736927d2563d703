//! `GatewayServer`: Axum HTTP + WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{ServerConfig, SessionConfig};
use crate::health::{self, HealthResponse};
use crate::registry::Registry;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::websocket::handler::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Group and session registry.
    pub registry: Arc<Registry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Configuration for sessions created by the upgrade handler.
    pub session_config: SessionConfig,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    session_config: SessionConfig,
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new server around `registry`.
    pub fn new(config: ServerConfig, session_config: SessionConfig, registry: Arc<Registry>) -> Self {
        Self {
            config,
            session_config,
            registry,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            session_config: self.session_config,
            max_message_size: self.config.max_message_size,
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener and serve in a background task.
    ///
    /// Returns the bound address and the serve task. The task stops
    /// accepting connections once shutdown is initiated.
    pub async fn listen(&self) -> knot_core::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        info!(%addr, "gateway listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
            info!("listener stopped");
        });

        Ok((addr, handle))
    }

    /// Stop intake and close every session within `timeout`.
    pub async fn close(&self, timeout: Duration) -> ShutdownOutcome {
        self.shutdown.close_sessions(self.registry.clone(), timeout).await
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.registry.count(),
        state.registry.session_count(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> GatewayServer {
        GatewayServer::new(ServerConfig::default(), SessionConfig::default(), Registry::new())
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert!(!server.shutdown().is_shutting_down());
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn health_endpoint_returns_counts() {
        let server = make_server();
        let (status, body) = get_body(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["teams"], 0);
        assert_eq!(parsed["sessions"], 0);
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn missing_team_is_bad_request() {
        let server = make_server();
        let (status, body) = get_body(server.router(), "/?uid=u1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("tid"));
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn missing_user_is_bad_request() {
        let server = make_server();
        let (status, body) = get_body(server.router(), "/ws?tid=t1&uid=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("uid"));
        assert_eq!(server.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn valid_params_without_upgrade_is_rejected() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/?tid=t1&uid=u1").await;
        assert!(status.is_client_error());
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn refuses_upgrades_while_shutting_down() {
        let server = make_server();
        server.shutdown().shutdown();
        let (status, _) = get_body(server.router(), "/?tid=t1&uid=u1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let (status, _) = get_body(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_body(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        let outcome = server.close(Duration::from_secs(1)).await;
        assert_eq!(outcome, ShutdownOutcome::Completed { sessions: 0 });
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
