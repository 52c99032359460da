//! `WebhookServer`: router construction and the serve loop.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_core::AgentOutcome;
use parley_engine::TaskExecutor;
use parley_webhook::NotificationVerifier;

use crate::health::{self, HealthResponse};
use crate::webhook;

/// Receiver settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Header carrying `sha256=<hex>`.
    pub signature_header: String,
    /// Header carrying the signing timestamp.
    pub timestamp_header: String,
    /// Larger bodies are refused with 413.
    pub max_body_bytes: usize,
    /// Capacity of the outcome broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signature_header: "x-parley-signature".to_string(),
            timestamp_header: "x-parley-timestamp".to_string(),
            max_body_bytes: 1024 * 1024,
            broadcast_capacity: 256,
        }
    }
}

/// Receiver startup and serve failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was tried.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// Executor notifications resume.
    pub executor: Arc<TaskExecutor>,
    /// Signature checker.
    pub verifier: Arc<NotificationVerifier>,
    /// Receiver settings.
    pub config: Arc<ServerConfig>,
    /// Publishes every accepted outcome.
    pub outcomes: broadcast::Sender<AgentOutcome>,
    /// Renders `/metrics` when installed.
    pub prometheus: Option<PrometheusHandle>,
    /// For `/health` uptime.
    pub start_time: Instant,
}

/// HTTP receiver for agent notifications.
pub struct WebhookServer {
    state: AppState,
}

impl WebhookServer {
    /// Receiver without a metrics handle.
    pub fn new(executor: Arc<TaskExecutor>, verifier: NotificationVerifier, config: ServerConfig) -> Self {
        let (outcomes, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            state: AppState {
                executor,
                verifier: Arc::new(verifier),
                config: Arc::new(config),
                outcomes,
                prometheus: None,
                start_time: Instant::now(),
            },
        }
    }

    /// Serve metrics from this handle.
    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.state.prometheus = Some(handle);
        self
    }

    /// Outcomes of every task a notification finished or advanced.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentOutcome> {
        self.state.outcomes.subscribe()
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Routes: `POST /webhooks`, `POST /webhooks/{task_type}/{agent_id}/{operation_id}`, `GET /health`, `GET /metrics`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/webhooks", post(webhook::receive_with_query))
            .route("/webhooks/{task_type}/{agent_id}/{operation_id}", post(webhook::receive_with_path))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(RequestBodyLimitLayer::new(self.state.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind a listener, naming the address on failure.
    pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Serve until `shutdown` is cancelled; in-flight requests drain first.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "webhook receiver listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("webhook receiver stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.executor.registry().len(),
        state.verifier.is_configured(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(state.prometheus.as_ref()),
    )
}
