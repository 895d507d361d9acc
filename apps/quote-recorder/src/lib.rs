#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Quote Recorder - Market Data Ingestion
//!
//! Keeps a WebSocket connection to the ALOR quote-dispatch endpoint, renews
//! the `QuotesSubscribe` subscription on a fixed interval, and appends every
//! valid quote to the `quotes` table of a SQLite file.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Quote validation
//!   - `quote`: `QuoteRecord` and the validation rules
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `QuoteSink`, `ChannelSender`
//!   - `services`: ingestion pipeline, subscription controller, connection
//!     supervisor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `alor`: WebSocket client with reconnect backoff
//!   - `storage`: SQLite store and queued writer
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                     ┌─────────────┐  Message  ┌──────────┐  try_send  ┌────────┐
//! ALOR WS ──frames──► │ Supervisor  │──────────►│ Pipeline │──────────► │ Writer │──► SQLite
//!                     └─────────────┘           └──────────┘            └────────┘
//!                            │ Opened
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Subscription│──subscribe / renew every interval──► ALOR WS
//!                     └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Quote types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::quote::{QuoteRecord, RejectionReason, validate};

// Ports
pub use application::ports::{ChannelSender, QuoteSink, SendError, StorageError};

// Services
pub use application::services::{
    ChannelEvent, ConnectionState, ConnectionStatus, ConnectionSupervisor, GuidMode, IngestError,
    IngestStats, IngestStatsSnapshot, QuotePipeline, RenewalHandle, SubscriptionController,
    SubscriptionError, SubscriptionRequest, SubscriptionSettings, SupervisorError,
};

// Infrastructure config
pub use infrastructure::config::{
    AccessToken, ConfigError, FeedSettings, RecorderConfig, ServerSettings, StorageSettings,
    WebSocketSettings,
};

// Stream client
pub use infrastructure::alor::{
    QuoteStreamClient, ReconnectConfig, ReconnectPolicy, StreamClientConfig, StreamClientError,
    WsSender,
};

// Storage
pub use infrastructure::storage::{
    QueuedQuoteSink, SqliteQuoteStore, WriterHandle, WriterReport, WriterStats,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
