//! `EnrollServer`: the axum router plus listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use enroll_core::ids::SessionId;
use enroll_runtime::EnrollService;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::{self, ApiError};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::ConnectionTracker;
use crate::websocket::session::{ObserverParams, run_observer};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Control service.
    pub service: Arc<EnrollService>,
    /// Open observer slots.
    pub connections: Arc<ConnectionTracker>,
    /// Shutdown signal.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus renderer.
    pub metrics: PrometheusHandle,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
}

/// HTTP + `WebSocket` server around an [`EnrollService`].
pub struct EnrollServer {
    state: AppState,
}

impl EnrollServer {
    /// Create a server.
    pub fn new(config: ServerConfig, service: Arc<EnrollService>, metrics: PrometheusHandle) -> Self {
        let connections = Arc::new(ConnectionTracker::new(config.max_connections));
        Self {
            state: AppState {
                service,
                connections,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics,
                config: Arc::new(config),
                start_time: Instant::now(),
            },
        }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/{id}", get(ws_handler))
            .merge(api::routes())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until shutdown is signalled.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, "listening");
        Ok((addr, handle))
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.service.active_sessions(),
        state.connections.active(),
        state.service.running_tasks(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Default, Deserialize)]
struct ObserveQuery {
    #[serde(default)]
    after: u64,
}

/// GET /ws/{id}?after=N
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ObserveQuery>,
) -> Response {
    let session_id = SessionId::from(id);
    if let Err(e) = state.service.status(&session_id) {
        return ApiError::from(e).into_response();
    }
    let Some(slot) = state.connections.try_acquire() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "too many observers").into_response();
    };

    let params = ObserverParams {
        session_id,
        after_seq: query.after,
        ping_interval: state.config.heartbeat_interval,
        pong_timeout: state.config.heartbeat_timeout,
        shutdown: state.shutdown.token(),
    };
    let service = Arc::clone(&state.service);
    ws.on_upgrade(move |socket| run_observer(socket, service, params, slot))
}
