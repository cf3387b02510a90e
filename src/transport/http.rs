//! HTTP transport exposing the dispatcher.
//!
//! Routes:
//! - `POST /api/queries/execute`: run one query
//! - `GET /health`: liveness plus the cached connections
//! - `GET /`: service name and endpoint list

use crate::config;
use crate::db::Pool;
use crate::dispatcher::Dispatcher;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteRequest, Row};
use crate::transport::Transport;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Time allowed for in-flight requests after a shutdown signal.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state.
pub struct AppState<P: Pool> {
    dispatcher: Arc<Dispatcher<P>>,
    started_at: Instant,
}

/// Successful query response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    data: Vec<Row>,
    row_count: usize,
    truncated: bool,
    execution_time_ms: u64,
}

/// Build the router. CORS allows any origin when `cors_origins` is empty or
/// contains `*`.
pub fn router<P: Pool>(dispatcher: Arc<Dispatcher<P>>, cors_origins: &[String]) -> Router {
    let state = Arc::new(AppState {
        dispatcher,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/api/queries/execute", post(execute::<P>))
        .route("/health", get(health::<P>))
        .route("/", get(index))
        .fallback(not_found)
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if config::any_origin(origins) {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

async fn execute<P: Pool>(
    State(state): State<Arc<AppState<P>>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return DbError::validation(format!("Invalid request body: {}", rejection.body_text()))
                .into_response();
        }
    };

    match state.dispatcher.execute(request).await {
        Ok(result) => Json(ExecuteResponse {
            row_count: result.row_count(),
            data: result.rows,
            truncated: result.truncated,
            execution_time_ms: result.execution_time_ms,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health<P: Pool>(State(state): State<Arc<AppState<P>>>) -> Response {
    let connections = state.dispatcher.connections().await;
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "connectionCount": connections.len(),
        "activeConnections": connections,
    }))
    .into_response()
}

async fn index() -> Response {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "execute": "POST /api/queries/execute",
            "health": "GET /health",
        },
    }))
    .into_response()
}

async fn not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": format!("Route {} does not exist", uri.path()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// HTTP transport implementation.
pub struct HttpTransport<P: Pool> {
    dispatcher: Arc<Dispatcher<P>>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
    cors_origins: Vec<String>,
}

impl<P: Pool> HttpTransport<P> {
    /// Create a new HTTP transport.
    ///
    /// # Arguments
    ///
    /// * `dispatcher` - Shared dispatcher; its pool is closed on shutdown
    /// * `host` - Host address to bind to
    /// * `port` - Port to bind to
    /// * `cors_origins` - Allowed origins (`*` for any)
    pub fn new(
        dispatcher: Arc<Dispatcher<P>>,
        host: impl Into<String>,
        port: u16,
        cors_origins: Vec<String>,
    ) -> Self {
        Self {
            dispatcher,
            host: host.into(),
            port,
            cors_origins,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl<P: Pool> Transport for HttpTransport<P> {
    async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        let app = router(self.dispatcher.clone(), &self.cors_origins);

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        info!(addr = %bind_addr, "Query dispatch service listening");

        // Use a notify to coordinate shutdown timing
        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        // Slow queries may hold the server open; force exit after a timeout or a second signal
        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for in-flight queries (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        self.dispatcher.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
