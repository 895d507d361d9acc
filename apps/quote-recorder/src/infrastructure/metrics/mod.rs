//! Prometheus Metrics Module
//!
//! Exposes recorder metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: received, accepted, and dropped by reason
//! - **Connection**: whether the quote channel is open, reconnect attempts
//! - **Subscription**: subscribe frames sent and failed
//! - **Storage**: rows committed, background write failures, write latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the one already installed.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

const MESSAGES_RECEIVED: &str = "quote_recorder_messages_received_total";
const QUOTES_ACCEPTED: &str = "quote_recorder_quotes_accepted_total";
const QUOTES_PERSISTED: &str = "quote_recorder_quotes_persisted_total";
const MESSAGES_DROPPED: &str = "quote_recorder_messages_dropped_total";
const CONNECTION_OPEN: &str = "quote_recorder_connection_open";
const RECONNECTS: &str = "quote_recorder_reconnects_total";
const SUBSCRIPTIONS_SENT: &str = "quote_recorder_subscriptions_sent_total";
const SUBSCRIPTIONS_FAILED: &str = "quote_recorder_subscription_failures_total";
const STORAGE_ERRORS: &str = "quote_recorder_storage_errors_total";
const WRITE_DURATION: &str = "quote_recorder_write_seconds";

fn register_metrics() {
    describe_counter!(MESSAGES_RECEIVED, "Total text messages received from the feed");
    describe_counter!(QUOTES_ACCEPTED, "Total quotes accepted by the sink");
    describe_counter!(MESSAGES_DROPPED, "Total messages dropped, by reason");

    describe_gauge!(CONNECTION_OPEN, "1 while the quote channel is open");
    describe_counter!(RECONNECTS, "Total reconnection attempts");

    describe_counter!(SUBSCRIPTIONS_SENT, "Total subscribe frames sent, by kind");
    describe_counter!(SUBSCRIPTIONS_FAILED, "Total subscribe frames that failed to send");

    describe_counter!(QUOTES_PERSISTED, "Total quote rows committed");
    describe_counter!(STORAGE_ERRORS, "Total background write failures, by kind");
    describe_histogram!(WRITE_DURATION, "Time to commit one quote row");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a text message handed to the pipeline.
pub fn record_message_received() {
    counter!(MESSAGES_RECEIVED).increment(1);
}

/// Record a quote accepted by the sink.
pub fn record_quote_accepted() {
    counter!(QUOTES_ACCEPTED).increment(1);
}

/// Record a quote row committed by the writer.
pub fn record_quote_persisted() {
    counter!(QUOTES_PERSISTED).increment(1);
}

/// Record a message dropped by the pipeline.
pub fn record_message_dropped(reason: &'static str) {
    counter!(MESSAGES_DROPPED, "reason" => reason).increment(1);
}

/// Update the connection gauge.
pub fn set_connection_open(open: bool) {
    gauge!(CONNECTION_OPEN).set(if open { 1.0 } else { 0.0 });
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!(RECONNECTS).increment(1);
}

/// Record a subscribe frame sent; `kind` is `initial` or `renewal`.
pub fn record_subscription_sent(kind: &'static str) {
    counter!(SUBSCRIPTIONS_SENT, "kind" => kind).increment(1);
}

/// Record a subscribe frame that could not be sent.
pub fn record_subscription_failed() {
    counter!(SUBSCRIPTIONS_FAILED).increment(1);
}

/// Record a write that failed after the record left the pipeline.
pub fn record_storage_error(kind: &'static str) {
    counter!(STORAGE_ERRORS, "kind" => kind).increment(1);
}

/// Record the time taken to commit one row.
pub fn record_write_duration(duration: Duration) {
    histogram!(WRITE_DURATION).record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received();
        record_message_dropped("decode");
        set_connection_open(true);
        record_write_duration(Duration::from_millis(3));
    }

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            MESSAGES_RECEIVED,
            QUOTES_ACCEPTED,
            QUOTES_PERSISTED,
            MESSAGES_DROPPED,
            CONNECTION_OPEN,
            RECONNECTS,
            SUBSCRIPTIONS_SENT,
            SUBSCRIPTIONS_FAILED,
            STORAGE_ERRORS,
            WRITE_DURATION,
        ] {
            assert!(name.starts_with("quote_recorder_"), "{name}");
        }
    }
}
