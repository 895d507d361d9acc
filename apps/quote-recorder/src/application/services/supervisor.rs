//! Connection Supervisor
//!
//! Explicit state machine for one logical channel, driven by [`ChannelEvent`]s
//! from the transport adapter.
//!
//! # State Machine
//!
//! ```text
//!            connect()            Opened(sender)
//!   Idle ───────────────► Connecting ──────────────► Open ◄──┐
//!                           │    │                    │ │    │ Message
//!                     Error │    │ Closed       Error │ │ └──┘
//!                           ▼    ▼                    ▼ │ Closed
//!                        Failed  Closed ◄─────── Failed │
//!                           │      ▲                    │
//!                           │      └────────────────────┘
//!                           └──── connect() ───► Connecting (reconnect)
//! ```
//!
//! Entering `Closed` or `Failed` disarms the renewal ticker. Per-message
//! failures are handled by the pipeline and never change the state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::pipeline::QuotePipeline;
use super::subscription::{RenewalHandle, SubscriptionController};
use crate::application::ports::{ChannelSender, QuoteSink};
use crate::infrastructure::metrics;

// =============================================================================
// States and Events
// =============================================================================

/// Lifecycle state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Dialing the endpoint.
    Connecting,
    /// Channel established; quotes are flowing.
    Open,
    /// The channel was closed.
    Closed,
    /// The channel failed.
    Failed,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// Whether the current attempt is over.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the transport observed.
pub enum ChannelEvent {
    /// The channel is established; carries the send capability.
    Opened(Arc<dyn ChannelSender>),
    /// A text payload arrived.
    Message(String),
    /// The transport failed.
    Error(String),
    /// The channel closed.
    Closed,
}

impl ChannelEvent {
    /// Event name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Opened(_) => "opened",
            Self::Message(_) => "message",
            Self::Error(_) => "error",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened(_) => f.write_str("Opened(..)"),
            Self::Message(text) => f.debug_tuple("Message").field(text).finish(),
            Self::Error(cause) => f.debug_tuple("Error").field(cause).finish(),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// Errors raised by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// `connect()` was called while a connection attempt is active.
    #[error("cannot connect while {0}")]
    InvalidTransition(ConnectionState),
}

// =============================================================================
// Shared Status
// =============================================================================

/// Connection status shared with the health endpoint.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    state: RwLock<ConnectionState>,
    last_opened_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    connections_opened: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl ConnectionStatus {
    /// Create status in the `Idle` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Open {
            *self.last_opened_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
            self.connections_opened.fetch_add(1, Ordering::Relaxed);
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    fn set_error(&self, cause: String) {
        *self.last_error.write() = Some(cause);
    }

    /// Count one reconnect attempt since the last successful open.
    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// When the channel last reached `Open`.
    #[must_use]
    pub fn last_opened_at(&self) -> Option<DateTime<Utc>> {
        *self.last_opened_at.read()
    }

    /// Last transport error, cleared on open.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Number of times the channel reached `Open`.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the channel lifecycle and dispatches inbound messages.
pub struct ConnectionSupervisor<S> {
    state: ConnectionState,
    pipeline: QuotePipeline<S>,
    controller: Arc<SubscriptionController>,
    renewal: Option<RenewalHandle>,
    status: Arc<ConnectionStatus>,
}

impl<S: QuoteSink> ConnectionSupervisor<S> {
    /// Create a supervisor in the `Idle` state.
    pub fn new(pipeline: QuotePipeline<S>, controller: Arc<SubscriptionController>) -> Self {
        Self {
            state: ConnectionState::Idle,
            pipeline,
            controller,
            renewal: None,
            status: Arc::new(ConnectionStatus::new()),
        }
    }

    /// Current state.
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Status shared with observers.
    #[must_use]
    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    /// The ingestion pipeline.
    pub const fn pipeline(&self) -> &QuotePipeline<S> {
        &self.pipeline
    }

    /// The subscription controller.
    #[must_use]
    pub fn controller(&self) -> Arc<SubscriptionController> {
        Arc::clone(&self.controller)
    }

    /// Whether a renewal ticker is running for the current connection.
    pub fn is_renewal_armed(&self) -> bool {
        self.renewal.as_ref().is_some_and(RenewalHandle::is_armed)
    }

    /// Begin a connection attempt.
    ///
    /// Allowed from `Idle` and, for reconnects, from `Closed` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::InvalidTransition` while `Connecting` or
    /// `Open`.
    pub fn connect(&mut self) -> Result<(), SupervisorError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed => {
                self.set_state(ConnectionState::Connecting);
                Ok(())
            }
            state @ (ConnectionState::Connecting | ConnectionState::Open) => {
                Err(SupervisorError::InvalidTransition(state))
            }
        }
    }

    /// Apply one transport event and return the resulting state.
    pub async fn handle_event(&mut self, event: ChannelEvent) -> ConnectionState {
        match (self.state, event) {
            (ConnectionState::Connecting, ChannelEvent::Opened(sender)) => {
                self.set_state(ConnectionState::Open);
                tracing::info!("Quote channel open");
                let renewal = self.controller.on_connect(sender).await;
                self.renewal = Some(renewal);
            }
            (ConnectionState::Open, ChannelEvent::Message(text)) => {
                self.pipeline.handle(&text);
            }
            (ConnectionState::Connecting | ConnectionState::Open, ChannelEvent::Error(cause)) => {
                tracing::error!(state = %self.state, error = %cause, "Quote channel failed");
                self.status.set_error(cause);
                self.teardown(ConnectionState::Failed);
            }
            (ConnectionState::Connecting | ConnectionState::Open, ChannelEvent::Closed) => {
                tracing::info!(state = %self.state, "Quote channel closed");
                self.teardown(ConnectionState::Closed);
            }
            (state, event) => {
                tracing::debug!(state = %state, event = event.kind(), "Ignoring channel event");
            }
        }
        self.state
    }

    fn teardown(&mut self, state: ConnectionState) {
        if let Some(renewal) = self.renewal.take() {
            renewal.disarm();
        }
        self.set_state(state);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.set_state(state);
        metrics::set_connection_open(state == ConnectionState::Open);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::services::subscription::SubscriptionSettings;
    use crate::application::services::testing::{MemorySink, RecordingSender};

    const INTERVAL: Duration = Duration::from_secs(600);
    const SBER: &str = r#"{"data":{"symbol":"SBER","time":1700000000,"bid":250.1,"ask":250.3,"last_price":250.2,"volume":100}}"#;

    fn supervisor() -> ConnectionSupervisor<MemorySink> {
        let controller = Arc::new(SubscriptionController::new(
            SubscriptionSettings::all_instruments("token"),
            INTERVAL,
        )
        .unwrap());
        ConnectionSupervisor::new(QuotePipeline::new(MemorySink::default()), controller)
    }

    async fn open(
        supervisor: &mut ConnectionSupervisor<MemorySink>,
    ) -> Arc<RecordingSender> {
        let sender = Arc::new(RecordingSender::default());
        supervisor.connect().unwrap();
        let state = supervisor
            .handle_event(ChannelEvent::Opened(sender.clone()))
            .await;
        assert_eq!(state, ConnectionState::Open);
        sender
    }

    #[test]
    fn connect_moves_idle_to_connecting() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.state(), ConnectionState::Idle);

        supervisor.connect().unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Connecting);
        assert_eq!(supervisor.status().state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_while_connecting_is_rejected() {
        let mut supervisor = supervisor();
        supervisor.connect().unwrap();

        assert_eq!(
            supervisor.connect(),
            Err(SupervisorError::InvalidTransition(ConnectionState::Connecting))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_subscribes_and_arms_renewal() {
        let mut supervisor = supervisor();

        let sender = open(&mut supervisor).await;

        assert_eq!(sender.sent_count(), 1);
        assert!(supervisor.is_renewal_armed());
        assert_eq!(supervisor.status().connections_opened(), 1);
        assert!(supervisor.status().last_opened_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_flow_into_the_sink() {
        let mut supervisor = supervisor();
        open(&mut supervisor).await;

        let state = supervisor
            .handle_event(ChannelEvent::Message(SBER.to_string()))
            .await;

        assert_eq!(state, ConnectionState::Open);
        let rows = supervisor.pipeline().sink().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "SBER");
        assert!((rows[0].last_price - 250.2).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_messages_keep_the_channel_open() {
        let mut supervisor = supervisor();
        open(&mut supervisor).await;

        for payload in [
            "not json at all",
            r#"{"status":"ok"}"#,
            r#"{"data":{"symbol":"SBER","time":1700000000,"bid":null,"ask":250.3,"last_price":250.2,"volume":100}}"#,
            r#"{"data":{"symbol":"SBER"}}"#,
        ] {
            let state = supervisor
                .handle_event(ChannelEvent::Message(payload.to_string()))
                .await;
            assert_eq!(state, ConnectionState::Open);
        }

        assert!(supervisor.pipeline().sink().rows().is_empty());
        assert!(supervisor.is_renewal_armed());
        let stats = supervisor.pipeline().stats().snapshot();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.malformed_envelopes, 1);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_is_independent_of_message_volume() {
        let mut supervisor = supervisor();
        let sender = open(&mut supervisor).await;

        for _ in 0..500 {
            supervisor
                .handle_event(ChannelEvent::Message(SBER.to_string()))
                .await;
        }
        tokio::time::sleep(INTERVAL * 2 + INTERVAL / 2).await;

        assert_eq!(sender.sent_count(), 1 + 2);
        assert_eq!(supervisor.pipeline().sink().rows().len(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn close_disarms_renewal() {
        let mut supervisor = supervisor();
        let sender = open(&mut supervisor).await;
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;
        assert_eq!(sender.sent_count(), 2);

        let state = supervisor.handle_event(ChannelEvent::Closed).await;
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(state, ConnectionState::Closed);
        assert!(!supervisor.is_renewal_armed());
        assert_eq!(sender.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn error_fails_and_disarms_renewal() {
        let mut supervisor = supervisor();
        let sender = open(&mut supervisor).await;

        let state = supervisor
            .handle_event(ChannelEvent::Error("connection reset".to_string()))
            .await;
        tokio::time::sleep(INTERVAL * 3).await;

        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(
            supervisor.status().last_error().as_deref(),
            Some("connection reset")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_while_connecting_fails_without_subscribing() {
        let mut supervisor = supervisor();
        supervisor.connect().unwrap();

        let state = supervisor
            .handle_event(ChannelEvent::Error("dns failure".to_string()))
            .await;

        assert_eq!(state, ConnectionState::Failed);
        assert!(!supervisor.is_renewal_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn events_outside_open_are_ignored() {
        let mut supervisor = supervisor();

        let state = supervisor
            .handle_event(ChannelEvent::Message(SBER.to_string()))
            .await;
        assert_eq!(state, ConnectionState::Idle);

        let state = supervisor.handle_event(ChannelEvent::Closed).await;
        assert_eq!(state, ConnectionState::Idle);
        assert!(supervisor.pipeline().sink().rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_open_is_ignored() {
        let mut supervisor = supervisor();
        let first = open(&mut supervisor).await;
        let second = Arc::new(RecordingSender::default());

        let state = supervisor
            .handle_event(ChannelEvent::Opened(second.clone()))
            .await;
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;

        assert_eq!(state, ConnectionState::Open);
        assert_eq!(first.sent_count(), 2);
        assert_eq!(second.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_failure_rearms_on_new_channel() {
        let mut supervisor = supervisor();
        let old = open(&mut supervisor).await;
        supervisor
            .handle_event(ChannelEvent::Error("reset".to_string()))
            .await;

        let new = open(&mut supervisor).await;
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;

        assert_eq!(old.sent_count(), 1);
        assert_eq!(new.sent_count(), 2);
        assert_eq!(supervisor.status().connections_opened(), 2);
        assert!(supervisor.status().last_error().is_none());
    }
}
