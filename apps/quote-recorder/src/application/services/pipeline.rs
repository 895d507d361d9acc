//! Ingestion Pipeline
//!
//! Turns one inbound text frame into at most one stored quote:
//!
//! ```text
//! text ──decode──► JSON ──envelope──► data object ──validate──► QuoteRecord ──append──► sink
//! ```
//!
//! Every failure is local to the message. The pipeline never returns an error
//! that should affect the connection; [`QuotePipeline::handle`] logs and drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::application::ports::{QuoteSink, StorageError};
use crate::domain::quote::{QuoteRecord, RejectionReason, validate};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Why a message did not produce a stored quote.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The payload is not valid JSON.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Valid JSON without an object under `data`.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The `data` object failed validation.
    #[error("quote rejected: {reason}")]
    Rejected {
        /// Validation failure.
        reason: RejectionReason,
        /// Symbol, when the payload carried a usable one.
        symbol: Option<String>,
    },

    /// The sink did not accept the record.
    #[error("storage error for {symbol}: {source}")]
    Storage {
        /// Symbol of the dropped record.
        symbol: String,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },
}

impl IngestError {
    /// Short label used for metrics and structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::Rejected { .. } => "rejected",
            Self::Storage { .. } => "storage",
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Per-outcome message counters, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    accepted: AtomicU64,
    decode_errors: AtomicU64,
    malformed_envelopes: AtomicU64,
    rejected: AtomicU64,
    storage_errors: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    /// Messages handed to the pipeline.
    pub received: u64,
    /// Records accepted by the sink. With a queued sink this counts queued
    /// records; commits are reported by the writer.
    pub accepted: u64,
    /// Messages that were not JSON.
    pub decode_errors: u64,
    /// Messages without a `data` object.
    pub malformed_envelopes: u64,
    /// Quotes that failed validation.
    pub rejected: u64,
    /// Records the sink refused.
    pub storage_errors: u64,
}

impl IngestStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            malformed_envelopes: self.malformed_envelopes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Result<QuoteRecord, IngestError>) {
        let counter = match outcome {
            Ok(_) => &self.accepted,
            Err(IngestError::Decode(_)) => &self.decode_errors,
            Err(IngestError::MalformedEnvelope(_)) => &self.malformed_envelopes,
            Err(IngestError::Rejected { .. }) => &self.rejected,
            Err(IngestError::Storage { .. }) => &self.storage_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Decode → validate → persist for inbound messages.
pub struct QuotePipeline<S> {
    sink: S,
    stats: Arc<IngestStats>,
}

impl<S: QuoteSink> QuotePipeline<S> {
    /// Create a pipeline writing into `sink`.
    pub fn new(sink: S) -> Self {
        Self::with_stats(sink, Arc::new(IngestStats::new()))
    }

    /// Create a pipeline that reports into existing counters.
    pub const fn with_stats(sink: S, stats: Arc<IngestStats>) -> Self {
        Self { sink, stats }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// The sink records are appended to.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Run one payload through the pipeline and count the outcome.
    ///
    /// # Errors
    ///
    /// Returns the [`IngestError`] that caused the message to be dropped.
    pub fn process(&self, payload: &str) -> Result<QuoteRecord, IngestError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_received();

        let outcome = self.ingest(payload);
        self.stats.record(&outcome);
        match &outcome {
            Ok(_) => metrics::record_quote_accepted(),
            Err(e) => metrics::record_message_dropped(e.kind()),
        }
        outcome
    }

    /// Run one payload through the pipeline, logging any drop.
    pub fn handle(&self, payload: &str) {
        match self.process(payload) {
            Ok(record) => {
                tracing::trace!(symbol = %record.symbol, time = record.time, "Quote accepted");
            }
            Err(IngestError::Decode(e)) => {
                tracing::warn!(kind = "decode", error = %e, "Dropping undecodable message");
            }
            Err(IngestError::MalformedEnvelope(detail)) => {
                tracing::warn!(kind = "malformed_envelope", detail = %detail, "Dropping message without quote data");
            }
            Err(IngestError::Rejected { reason, symbol }) => {
                tracing::warn!(
                    kind = reason.kind(),
                    symbol = symbol.as_deref().unwrap_or("<unknown>"),
                    reason = %reason,
                    "Dropping invalid quote"
                );
            }
            Err(IngestError::Storage { symbol, source }) => {
                tracing::error!(
                    kind = source.kind(),
                    symbol = %symbol,
                    error = %source,
                    "Failed to store quote"
                );
            }
        }
    }

    fn ingest(&self, payload: &str) -> Result<QuoteRecord, IngestError> {
        let value: Value = serde_json::from_str(payload)?;

        let mut envelope = match value {
            Value::Object(envelope) => envelope,
            other => {
                return Err(IngestError::MalformedEnvelope(format!(
                    "expected a JSON object, got {}",
                    json_type(&other)
                )));
            }
        };

        let data = match envelope.remove("data") {
            Some(Value::Object(data)) => data,
            Some(other) => {
                return Err(IngestError::MalformedEnvelope(format!(
                    "`data` is {}, not an object",
                    json_type(&other)
                )));
            }
            None => {
                let keys: Vec<&str> = envelope.keys().map(String::as_str).collect();
                return Err(IngestError::MalformedEnvelope(format!(
                    "no `data` key (keys: {})",
                    keys.join(", ")
                )));
            }
        };

        let record = validate(&data).map_err(|reason| IngestError::Rejected {
            reason,
            symbol: data
                .get("symbol")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })?;

        self.sink
            .append(record.clone())
            .map_err(|source| IngestError::Storage {
                symbol: record.symbol.clone(),
                source,
            })?;

        Ok(record)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// Tests
// =============================================================================
