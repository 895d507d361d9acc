//! Subscription Controller
//!
//! Keeps the server pushing quotes by re-asserting the `QuotesSubscribe`
//! request on a fixed wall-clock cadence.
//!
//! # Lifecycle
//!
//! ```text
//! on_connect ──► initial subscribe ──► ticker armed (first tick at open + interval)
//!                                         │
//!                         every interval ─┤─► subscribe (failure logged, next tick retries)
//!                                         │
//! RenewalHandle dropped / disarmed ───────┘─► ticker stops, no further sends
//! ```
//!
//! Renewal is time-triggered only. Inbound traffic neither delays nor
//! advances it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ChannelSender, SendError};
use crate::infrastructure::metrics;

// =============================================================================
// Constants
// =============================================================================

/// Opcode of the subscribe request.
pub const QUOTES_SUBSCRIBE_OPCODE: &str = "QuotesSubscribe";

/// Correlation id sent when the id is fixed.
pub const DEFAULT_SUBSCRIPTION_GUID: &str = "quotes_subscription";

/// Renewal cadence used when none is configured.
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(600);

/// Longest accepted renewal cadence.
pub const MAX_RENEWAL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Request
// =============================================================================

/// The subscribe/renew message, serialized as the wire JSON.
///
/// Built fresh for every send.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Always [`QUOTES_SUBSCRIBE_OPCODE`].
    pub opcode: &'static str,
    /// Instrument selector (`ALL` for every instrument).
    pub code: String,
    /// Venue identifier.
    pub exchange: String,
    /// Payload shape selector.
    pub format: String,
    /// Bearer credential.
    pub token: String,
    /// Request correlation id.
    pub guid: String,
}

impl std::fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("opcode", &self.opcode)
            .field("code", &self.code)
            .field("exchange", &self.exchange)
            .field("format", &self.format)
            .field("token", &"[REDACTED]")
            .field("guid", &self.guid)
            .finish()
    }
}

/// How the correlation id is chosen for each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuidMode {
    /// Every request carries the same id.
    Fixed(String),
    /// Every request carries a fresh UUID v4.
    PerRequest,
}

impl Default for GuidMode {
    fn default() -> Self {
        Self::Fixed(DEFAULT_SUBSCRIPTION_GUID.to_string())
    }
}

impl GuidMode {
    fn next(&self) -> String {
        match self {
            Self::Fixed(guid) => guid.clone(),
            Self::PerRequest => uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// What to subscribe to.
#[derive(Clone)]
pub struct SubscriptionSettings {
    /// Instrument selector.
    pub code: String,
    /// Venue identifier.
    pub exchange: String,
    /// Payload shape selector.
    pub format: String,
    /// Bearer credential.
    pub token: String,
    /// Correlation id policy.
    pub guid: GuidMode,
}

impl SubscriptionSettings {
    /// All instruments on MOEX in the `Simple` format, with a fixed guid.
    #[must_use]
    pub fn all_instruments(token: impl Into<String>) -> Self {
        Self {
            code: "ALL".to_string(),
            exchange: "MOEX".to_string(),
            format: "Simple".to_string(),
            token: token.into(),
            guid: GuidMode::default(),
        }
    }
}

impl std::fmt::Debug for SubscriptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSettings")
            .field("code", &self.code)
            .field("exchange", &self.exchange)
            .field("format", &self.format)
            .field("token", &"[REDACTED]")
            .field("guid", &self.guid)
            .finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while sending a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The request could not be serialized.
    #[error("failed to encode subscription: {0}")]
    Encode(#[from] serde_json::Error),

    /// The channel did not accept the frame.
    #[error("failed to send subscription: {0}")]
    SendFailed(#[from] SendError),

    /// The renewal cadence is zero or longer than [`MAX_RENEWAL_INTERVAL`].
    #[error("renewal interval must be between 1s and {}s, got {interval:?}", MAX_RENEWAL_INTERVAL.as_secs())]
    InvalidInterval {
        /// Rejected cadence.
        interval: Duration,
    },
}

// =============================================================================
// Controller
// =============================================================================

/// Owns the renewable subscription for one endpoint.
#[derive(Debug)]
pub struct SubscriptionController {
    settings: SubscriptionSettings,
    interval: Duration,
    renewals_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl SubscriptionController {
    /// Create a controller renewing every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError::InvalidInterval` if `interval` is zero or
    /// exceeds [`MAX_RENEWAL_INTERVAL`].
    pub fn new(
        settings: SubscriptionSettings,
        interval: Duration,
    ) -> Result<Self, SubscriptionError> {
        if interval.is_zero() || interval > MAX_RENEWAL_INTERVAL {
            return Err(SubscriptionError::InvalidInterval { interval });
        }
        Ok(Self {
            settings,
            interval,
            renewals_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        })
    }

    /// Renewal cadence.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of successful renewals (initial subscribes excluded).
    #[must_use]
    pub fn renewals_sent(&self) -> u64 {
        self.renewals_sent.load(Ordering::Relaxed)
    }

    /// Number of subscribe sends that failed.
    #[must_use]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Build a fresh request.
    #[must_use]
    pub fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest {
            opcode: QUOTES_SUBSCRIBE_OPCODE,
            code: self.settings.code.clone(),
            exchange: self.settings.exchange.clone(),
            format: self.settings.format.clone(),
            token: self.settings.token.clone(),
            guid: self.settings.guid.next(),
        }
    }

    /// Serialize a fresh request and send it.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError::SendFailed` if the channel refuses the
    /// frame.
    pub async fn subscribe(&self, sender: &dyn ChannelSender) -> Result<(), SubscriptionError> {
        let request = self.request();
        let json = serde_json::to_string(&request)?;

        tracing::debug!(
            code = %request.code,
            exchange = %request.exchange,
            guid = %request.guid,
            "Sending quotes subscription"
        );

        if let Err(e) = sender.send_text(json).await {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_subscription_failed();
            return Err(e.into());
        }
        Ok(())
    }

    /// Subscribe on a freshly opened channel and arm the renewal ticker.
    ///
    /// A failed initial subscribe is logged; the first renewal retries it.
    pub async fn on_connect(self: &Arc<Self>, sender: Arc<dyn ChannelSender>) -> RenewalHandle {
        let now = Instant::now();
        // interval is bounded by new(); fall back to an immediate tick
        let first_renewal = now.checked_add(self.interval).unwrap_or(now);

        match self.subscribe(sender.as_ref()).await {
            Ok(()) => {
                metrics::record_subscription_sent("initial");
                tracing::info!(
                    interval_secs = self.interval.as_secs(),
                    "Quotes subscription sent"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial quotes subscription failed");
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run_renewals(sender, first_renewal, cancel.clone()));

        RenewalHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run_renewals(
        self: Arc<Self>,
        sender: Arc<dyn ChannelSender>,
        first_renewal: Instant,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(first_renewal, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.subscribe(sender.as_ref()) => match result {
                    Ok(()) => {
                        self.renewals_sent.fetch_add(1, Ordering::Relaxed);
                        metrics::record_subscription_sent("renewal");
                        tracing::debug!("Quotes subscription renewed");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "Quotes subscription renewal failed, retrying next interval"
                        );
                    }
                },
            }
        }

        tracing::debug!("Subscription renewal disarmed");
    }
}

// =============================================================================
// Renewal Handle
// =============================================================================

/// Owns the renewal ticker of one connection. Dropping it disarms the ticker.
#[derive(Debug)]
pub struct RenewalHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewalHandle {
    /// Stop the ticker. No renewal is sent after this returns.
    pub fn disarm(&self) {
        self.cancel.cancel();
    }

    /// Whether the ticker is still running.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Disarm and wait for the ticker task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Renewal task ended abnormally");
        }
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
