//! Test doubles for the ports.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{ChannelSender, QuoteSink, SendError, StorageError};
use crate::domain::quote::QuoteRecord;

/// Records every frame sent; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send_text(&self, text: String) -> Result<(), SendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }
}

/// Keeps appended records in memory; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<QuoteRecord>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn rows(&self) -> Vec<QuoteRecord> {
        self.rows.lock().clone()
    }
}

impl QuoteSink for MemorySink {
    fn ensure_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn append(&self, record: QuoteRecord) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Database("disk I/O error".to_string()));
        }
        self.rows.lock().push(record);
        Ok(())
    }
}
