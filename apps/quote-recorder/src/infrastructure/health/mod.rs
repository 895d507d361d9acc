//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status, and Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (ready while the quote channel is open)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::pipeline::{IngestStats, IngestStatsSnapshot};
use crate::application::services::subscription::SubscriptionController;
use crate::application::services::supervisor::{ConnectionState, ConnectionStatus};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::storage::{WriterReport, WriterStats};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Recorder version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Quote channel status.
    pub connection: ConnectionInfo,
    /// Message outcome counters.
    pub ingest: IngestStatsSnapshot,
    /// Subscription renewal status.
    pub subscription: SubscriptionInfo,
    /// Background writer counters, when a queued writer is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<WriterReport>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Channel open, quotes flowing.
    Healthy,
    /// Connecting or not yet started.
    Degraded,
    /// Channel closed or failed.
    Unhealthy,
}

/// Quote channel status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether the channel is open.
    pub connected: bool,
    /// Times the channel reached `Open`.
    pub connections_opened: u64,
    /// Reconnect attempts since the last open.
    pub reconnect_attempts: u32,
    /// When the channel last opened.
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Last transport error.
    pub last_error: Option<String>,
}

/// Subscription renewal status.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// Renewal cadence in seconds.
    pub renewal_interval_secs: u64,
    /// Renewals sent.
    pub renewals_sent: u64,
    /// Subscribe frames that failed to send.
    pub send_failures: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    connection: Arc<ConnectionStatus>,
    ingest: Arc<IngestStats>,
    subscription: Arc<SubscriptionController>,
    writer: Option<Arc<WriterStats>>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        connection: Arc<ConnectionStatus>,
        ingest: Arc<IngestStats>,
        subscription: Arc<SubscriptionController>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            connection,
            ingest,
            subscription,
            writer: None,
        }
    }

    /// Report the counters of a background writer.
    #[must_use]
    pub fn with_writer_stats(mut self, writer: Arc<WriterStats>) -> Self {
        self.writer = Some(writer);
        self
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.connection.state() == ConnectionState::Open {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connection_state = state.connection.state();

    HealthResponse {
        status: health_status(connection_state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection: ConnectionInfo {
            state: connection_state,
            connected: connection_state == ConnectionState::Open,
            connections_opened: state.connection.connections_opened(),
            reconnect_attempts: state.connection.reconnect_attempts(),
            last_opened_at: state.connection.last_opened_at(),
            last_error: state.connection.last_error(),
        },
        ingest: state.ingest.snapshot(),
        subscription: SubscriptionInfo {
            renewal_interval_secs: state.subscription.interval().as_secs(),
            renewals_sent: state.subscription.renewals_sent(),
            send_failures: state.subscription.send_failures(),
        },
        storage: state.writer.as_ref().map(|w| w.snapshot()),
    }
}

const fn health_status(state: ConnectionState) -> HealthStatus {
    match state {
        ConnectionState::Open => HealthStatus::Healthy,
        ConnectionState::Idle | ConnectionState::Connecting => HealthStatus::Degraded,
        ConnectionState::Closed | ConnectionState::Failed => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::services::pipeline::QuotePipeline;
    use crate::application::services::subscription::SubscriptionSettings;
    use crate::application::services::supervisor::{ChannelEvent, ConnectionSupervisor};
    use crate::application::services::testing::{MemorySink, RecordingSender};

    fn supervisor() -> ConnectionSupervisor<MemorySink> {
        let controller = Arc::new(SubscriptionController::new(
            SubscriptionSettings::all_instruments("token"),
            Duration::from_secs(600),
        )
        .unwrap());
        ConnectionSupervisor::new(QuotePipeline::new(MemorySink::default()), controller)
    }

    fn state_for(supervisor: &ConnectionSupervisor<MemorySink>) -> HealthServerState {
        HealthServerState::new(
            "0.1.0".to_string(),
            supervisor.status(),
            supervisor.pipeline().stats(),
            supervisor.controller(),
        )
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_connection_state() {
        assert_eq!(health_status(ConnectionState::Open), HealthStatus::Healthy);
        assert_eq!(health_status(ConnectionState::Idle), HealthStatus::Degraded);
        assert_eq!(health_status(ConnectionState::Connecting), HealthStatus::Degraded);
        assert_eq!(health_status(ConnectionState::Closed), HealthStatus::Unhealthy);
        assert_eq!(health_status(ConnectionState::Failed), HealthStatus::Unhealthy);
    }

    #[test]
    fn idle_recorder_is_degraded() {
        let supervisor = supervisor();

        let response = build_health_response(&state_for(&supervisor));

        assert_eq!(response.status, HealthStatus::Degraded);
        assert!(!response.connection.connected);
        assert_eq!(response.subscription.renewal_interval_secs, 600);
        assert_eq!(response.ingest, IngestStatsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn open_recorder_reports_counters() {
        let mut supervisor = supervisor();
        let state = state_for(&supervisor);
        supervisor.connect().unwrap();
        supervisor
            .handle_event(ChannelEvent::Opened(Arc::new(RecordingSender::default())))
            .await;
        supervisor
            .handle_event(ChannelEvent::Message(
                r#"{"data":{"symbol":"SBER","time":1,"bid":1.0,"ask":1.1,"last_price":1.05,"volume":10}}"#
                    .to_string(),
            ))
            .await;

        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Healthy);
        assert!(response.connection.connected);
        assert_eq!(response.connection.connections_opened, 1);
        assert_eq!(response.ingest.accepted, 1);
        assert!(response.storage.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["connection"]["state"], "open");
    }

    #[test]
    fn writer_failures_are_reported() {
        use crate::application::ports::QuoteSink;
        use crate::infrastructure::storage::{QueuedQuoteSink, SqliteQuoteStore};

        let dir = tempfile::tempdir().unwrap();
        let store = SqliteQuoteStore::new(dir.path().join("quotes.db"));
        let (sink, writer) = QueuedQuoteSink::start(store, 8).unwrap();
        let supervisor = supervisor();
        let state = state_for(&supervisor).with_writer_stats(sink.writer_stats());

        // table missing, so the writer drops the record
        sink.append(crate::domain::quote::QuoteRecord {
            symbol: "SBER".to_string(),
            time: 1,
            bid: 1.0,
            ask: 1.1,
            last_price: 1.05,
            volume: 10,
        })
        .unwrap();
        drop(sink);
        writer.join().unwrap();

        let response = build_health_response(&state);

        assert_eq!(response.storage, Some(WriterReport { written: 0, failed: 1 }));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["storage"]["failed"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recorder_reports_error() {
        let mut supervisor = supervisor();
        let state = state_for(&supervisor);
        supervisor.connect().unwrap();
        supervisor
            .handle_event(ChannelEvent::Error("connection refused".to_string()))
            .await;

        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(
            response.connection.last_error.as_deref(),
            Some("connection refused")
        );
    }
}
