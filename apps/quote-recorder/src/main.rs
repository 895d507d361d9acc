//! Quote Recorder Binary
//!
//! Streams ALOR quotes into SQLite until interrupted.
//!
//! # Usage
//!
//! ```bash
//! ALOR_ACCESS_TOKEN=... cargo run --bin quote-recorder
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ALOR_ACCESS_TOKEN`: bearer credential sent with every subscription
//!
//! ## Optional
//! - `ALOR_WS_URL`: endpoint (default: wss://api.alor.ru/ws)
//! - `QUOTES_DB_PATH`: SQLite file (default: database.db)
//! - `QUOTES_RENEWAL_INTERVAL_SECS`: renewal cadence (default: 600)
//! - `QUOTES_INSTRUMENT` / `QUOTES_EXCHANGE` / `QUOTES_FORMAT`: ALL / MOEX / Simple
//! - `QUOTES_GUID_MODE`: fixed | per-request (default: fixed)
//! - `QUOTES_SUBSCRIPTION_GUID`: fixed correlation id (default: quotes_subscription)
//! - `QUOTES_RECONNECT_DELAY_INITIAL_MS`, `QUOTES_RECONNECT_DELAY_MAX_SECS`,
//!   `QUOTES_RECONNECT_DELAY_MULTIPLIER`, `QUOTES_MAX_RECONNECT_ATTEMPTS`
//! - `QUOTES_CONNECT_TIMEOUT_SECS`: handshake bound (default: 10)
//! - `QUOTES_WRITER_QUEUE_CAPACITY`: writer queue size (default: 10000)
//! - `QUOTES_DB_BUSY_TIMEOUT_MS`: SQLite busy timeout (default: 5000)
//! - `QUOTES_HEALTH_PORT`: health/metrics port, 0 disables (default: 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log filter (default: quote_recorder=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quote_recorder::infrastructure::health::{HealthServer, HealthServerState};
use quote_recorder::infrastructure::telemetry;
use quote_recorder::{
    ConnectionSupervisor, QueuedQuoteSink, QuotePipeline, QuoteSink, QuoteStreamClient,
    ReconnectConfig, RecorderConfig, StreamClientConfig, SubscriptionController, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long the client gets to close the socket after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting quote recorder");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = RecorderConfig::from_env()?;
    log_config(&config);

    let store = config.storage.store();
    store
        .ensure_schema()
        .with_context(|| format!("failed to prepare {}", store.path().display()))?;

    let (sink, writer) = QueuedQuoteSink::start(store, config.storage.queue_capacity)?;
    let writer_stats = sink.writer_stats();

    let pipeline = QuotePipeline::new(sink);
    let controller = Arc::new(SubscriptionController::new(
        config.subscription(),
        config.feed.renewal_interval,
    )?);
    let supervisor = ConnectionSupervisor::new(pipeline, Arc::clone(&controller));

    let shutdown_token = CancellationToken::new();

    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            supervisor.status(),
            supervisor.pipeline().stats(),
            Arc::clone(&controller),
        )
        .with_writer_stats(writer_stats));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let client = QuoteStreamClient::new(
        StreamClientConfig {
            url: config.feed.url.clone(),
            reconnect: ReconnectConfig::from_settings(&config.websocket),
            connect_timeout: config.websocket.connect_timeout,
        },
        supervisor,
        shutdown_token.clone(),
    );
    let mut client_task = tokio::spawn(client.run());

    tracing::info!("Quote recorder ready");

    let client_result = tokio::select! {
        () = wait_for_signal() => {
            shutdown_token.cancel();
            if let Ok(joined) = tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut client_task).await {
                joined
            } else {
                tracing::warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Stream client did not stop in time, aborting"
                );
                client_task.abort();
                Ok(Ok(()))
            }
        }
        joined = &mut client_task => {
            shutdown_token.cancel();
            joined
        }
    };

    let report = tokio::task::spawn_blocking(move || writer.join())
        .await
        .context("writer join task failed")??;
    tracing::info!(
        written = report.written,
        failed = report.failed,
        "Quote recorder stopped"
    );

    client_result.context("stream client task panicked")??;
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RecorderConfig) {
    tracing::info!(
        url = %config.feed.url,
        instrument = %config.feed.instrument,
        exchange = %config.feed.exchange,
        renewal_interval_secs = config.feed.renewal_interval.as_secs(),
        db_path = %config.storage.db_path.display(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        guid = ?config.feed.guid,
        queue_capacity = config.storage.queue_capacity,
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        "Recorder settings"
    );
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
