//! Port Interfaces
//!
//! Contracts between the recorder's services and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`QuoteSink`]: durable append-only storage for validated quotes
//! - [`ChannelSender`]: the send half of the streaming channel, shared by the
//!   open handler and the renewal ticker

use async_trait::async_trait;

use crate::domain::quote::QuoteRecord;

// =============================================================================
// Storage
// =============================================================================

/// Errors raised by a [`QuoteSink`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The storage engine reported a fault.
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem preparation failed (e.g. creating the parent directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The write queue is full; the record was not accepted.
    #[error("write queue is full")]
    QueueFull,

    /// The writer is no longer running.
    #[error("writer stopped")]
    WriterStopped,
}

impl StorageError {
    /// Short label used for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::QueueFull => "queue_full",
            Self::WriterStopped => "writer_stopped",
        }
    }
}

/// Durable append-only table of quotes.
///
/// `ensure_schema` must succeed once before the first `append`, and may be
/// called any number of times.
pub trait QuoteSink: Send + Sync {
    /// Create the quotes table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the table cannot be created.
    fn ensure_schema(&self) -> Result<(), StorageError>;

    /// Append one record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the record was not accepted. The caller logs
    /// and drops the record; there is no retry.
    fn append(&self, record: QuoteRecord) -> Result<(), StorageError>;
}

impl<S: QuoteSink + ?Sized> QuoteSink for std::sync::Arc<S> {
    fn ensure_schema(&self) -> Result<(), StorageError> {
        (**self).ensure_schema()
    }

    fn append(&self, record: QuoteRecord) -> Result<(), StorageError> {
        (**self).append(record)
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Errors raised when transmitting on the channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The channel has been torn down.
    #[error("channel closed")]
    Closed,

    /// The transport refused the frame.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Capability to transmit one text frame on the channel.
///
/// Implementations must be safe to call concurrently from the dispatch loop
/// and the renewal ticker.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Send a text frame.
    async fn send_text(&self, text: String) -> Result<(), SendError>;
}
