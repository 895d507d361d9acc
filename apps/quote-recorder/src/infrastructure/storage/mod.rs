//! SQLite Quote Storage
//!
//! Two [`QuoteSink`] adapters over the append-only `quotes` table:
//!
//! - [`SqliteQuoteStore`] opens a connection per call and commits each
//!   record in its own transaction.
//! - [`QueuedQuoteSink`] puts records on a bounded queue drained by a
//!   dedicated writer thread, so a slow disk never stalls the dispatch loop.
//!
//! ```text
//! pipeline ──try_send──► [bounded queue] ──blocking_recv──► writer thread ──► SqliteQuoteStore
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::application::ports::{QuoteSink, StorageError};
use crate::domain::quote::QuoteRecord;
use crate::infrastructure::metrics;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest busy timeout SQLite accepts (`i32::MAX` milliseconds).
pub const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(2_147_483_647);

const CREATE_QUOTES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS quotes (
        symbol TEXT,
        time INTEGER,
        bid REAL,
        ask REAL,
        last_price REAL,
        volume INTEGER
    );
";

const INSERT_QUOTE: &str = "
    INSERT INTO quotes (symbol, time, bid, ask, last_price, volume)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
";

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

// =============================================================================
// Direct Store
// =============================================================================

/// Quote table in a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteQuoteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteQuoteStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Set how long a write waits on a locked database, capped at
    /// [`MAX_BUSY_TIMEOUT`].
    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = if busy_timeout.as_millis() > MAX_BUSY_TIMEOUT.as_millis() {
            MAX_BUSY_TIMEOUT
        } else {
            busy_timeout
        };
        self
    }

    /// How long a write waits on a locked database.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the table cannot be read.
    pub fn row_count(&self) -> Result<u64, StorageError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM quotes", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// All stored rows in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the table cannot be read.
    pub fn load_all(&self) -> Result<Vec<QuoteRecord>, StorageError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, time, bid, ask, last_price, volume FROM quotes ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QuoteRecord {
                symbol: row.get(0)?,
                time: row.get(1)?,
                bid: row.get(2)?,
                ask: row.get(3)?,
                last_price: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn open(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl QuoteSink for SqliteQuoteStore {
    fn ensure_schema(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.open()?;
        // best-effort
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch(CREATE_QUOTES_TABLE)?;

        tracing::debug!(path = %self.path.display(), "Quote table ready");
        Ok(())
    }

    fn append(&self, record: QuoteRecord) -> Result<(), StorageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            INSERT_QUOTE,
            rusqlite::params![
                record.symbol,
                record.time,
                record.bid,
                record.ask,
                record.last_price,
                record.volume,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

// =============================================================================
// Queued Sink
// =============================================================================

/// Writer thread totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterReport {
    /// Rows committed.
    pub written: u64,
    /// Records dropped because the insert failed.
    pub failed: u64,
}

/// Live writer counters, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct WriterStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl WriterStats {
    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> WriterReport {
        WriterReport {
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking sink that hands records to a background writer.
///
/// A successful `append` means the record was queued. Commits and insert
/// failures are counted in [`WriterStats`].
#[derive(Debug, Clone)]
pub struct QueuedQuoteSink {
    store: Arc<SqliteQuoteStore>,
    stats: Arc<WriterStats>,
    tx: mpsc::Sender<QuoteRecord>,
}

/// Owns the writer thread.
#[derive(Debug)]
pub struct WriterHandle {
    thread: JoinHandle<WriterReport>,
}

impl QueuedQuoteSink {
    /// Start a writer thread for `store` behind a queue of `capacity` records.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the thread cannot be spawned.
    pub fn start(
        store: SqliteQuoteStore,
        capacity: usize,
    ) -> Result<(Self, WriterHandle), StorageError> {
        let (sink, rx) = Self::channel(store, capacity);
        let store = Arc::clone(&sink.store);
        let stats = Arc::clone(&sink.stats);

        let thread = std::thread::Builder::new()
            .name("quote-writer".to_string())
            .spawn(move || run_writer(&store, &stats, rx))?;

        tracing::info!(capacity, path = %sink.store.path().display(), "Quote writer started");
        Ok((sink, WriterHandle { thread }))
    }

    fn channel(store: SqliteQuoteStore, capacity: usize) -> (Self, mpsc::Receiver<QuoteRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            store: Arc::new(store),
            stats: Arc::new(WriterStats::default()),
            tx,
        };
        (sink, rx)
    }

    /// Counters of the writer behind this sink.
    #[must_use]
    pub fn writer_stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Records waiting for the writer.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl QuoteSink for QueuedQuoteSink {
    fn ensure_schema(&self) -> Result<(), StorageError> {
        self.store.ensure_schema()
    }

    fn append(&self, record: QuoteRecord) -> Result<(), StorageError> {
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StorageError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => StorageError::WriterStopped,
        })
    }
}

impl WriterHandle {
    /// Wait for the writer to drain the queue and exit.
    ///
    /// The writer exits once every [`QueuedQuoteSink`] clone has been
    /// dropped; call this only after the dispatch loop is gone.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::WriterStopped` if the writer thread panicked.
    pub fn join(self) -> Result<WriterReport, StorageError> {
        self.thread.join().map_err(|_| StorageError::WriterStopped)
    }
}

fn run_writer(
    store: &SqliteQuoteStore,
    stats: &WriterStats,
    mut rx: mpsc::Receiver<QuoteRecord>,
) -> WriterReport {
    while let Some(record) = rx.blocking_recv() {
        let symbol = record.symbol.clone();
        let started = Instant::now();
        match store.append(record) {
            Ok(()) => {
                stats.written.fetch_add(1, Ordering::Relaxed);
                metrics::record_quote_persisted();
                metrics::record_write_duration(started.elapsed());
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_storage_error(e.kind());
                tracing::error!(symbol = %symbol, error = %e, "Failed to write quote");
            }
        }
    }

    let report = stats.snapshot();
    tracing::info!(
        written = report.written,
        failed = report.failed,
        "Quote writer drained"
    );
    report
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::pipeline::QuotePipeline;

    fn quote(symbol: &str, time: i64) -> QuoteRecord {
        QuoteRecord {
            symbol: symbol.to_string(),
            time,
            bid: 250.1,
            ask: 250.3,
            last_price: 250.2,
            volume: 100,
        }
    }

    fn temp_store() -> (tempfile::TempDir, SqliteQuoteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteQuoteStore::new(dir.path().join("quotes.db"));
        (dir, store)
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let (_dir, store) = temp_store();

        store.ensure_schema().unwrap();
        store.append(quote("SBER", 1)).unwrap();
        store.ensure_schema().unwrap();

        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[test]
    fn ensure_schema_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteQuoteStore::new(dir.path().join("nested/deeper/quotes.db"));

        store.ensure_schema().unwrap();

        assert!(store.path().exists());
    }

    #[test]
    fn oversized_busy_timeout_is_capped() {
        let (_dir, store) = temp_store();
        let store = store.with_busy_timeout(Duration::from_millis(3_000_000_000));

        assert_eq!(store.busy_timeout(), MAX_BUSY_TIMEOUT);
        store.ensure_schema().unwrap();
        store.append(quote("SBER", 1)).unwrap();
        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[test]
    fn append_round_trips_all_columns() {
        let (_dir, store) = temp_store();
        store.ensure_schema().unwrap();
        let record = quote("GAZP", 1_700_000_000);

        store.append(record.clone()).unwrap();

        assert_eq!(store.load_all().unwrap(), vec![record]);
    }

    #[test]
    fn duplicates_are_separate_rows() {
        let (_dir, store) = temp_store();
        store.ensure_schema().unwrap();

        store.append(quote("SBER", 1)).unwrap();
        store.append(quote("SBER", 1)).unwrap();

        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[test]
    fn append_without_schema_fails() {
        let (_dir, store) = temp_store();

        let err = store.append(quote("SBER", 1)).unwrap_err();

        assert!(matches!(err, StorageError::Database(ref msg) if msg.contains("quotes")));
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (_dir, store) = temp_store();
        let (sink, _rx) = QueuedQuoteSink::channel(store, 1);

        sink.append(quote("SBER", 1)).unwrap();
        let err = sink.append(quote("SBER", 2)).unwrap_err();

        assert!(matches!(err, StorageError::QueueFull));
        assert_eq!(sink.queued(), 1);
    }

    #[test]
    fn stopped_writer_is_reported() {
        let (_dir, store) = temp_store();
        let (sink, rx) = QueuedQuoteSink::channel(store, 4);
        drop(rx);

        let err = sink.append(quote("SBER", 1)).unwrap_err();

        assert!(matches!(err, StorageError::WriterStopped));
    }

    #[test]
    fn join_drains_queue() {
        let (_dir, store) = temp_store();
        store.ensure_schema().unwrap();
        let (sink, writer) = QueuedQuoteSink::start(store.clone(), 64).unwrap();

        for time in 0..50 {
            sink.append(quote("SBER", time)).unwrap();
        }
        drop(sink);
        let report = writer.join().unwrap();

        assert_eq!(report, WriterReport { written: 50, failed: 0 });
        assert_eq!(store.row_count().unwrap(), 50);
    }

    #[test]
    fn writer_survives_failed_inserts() {
        let (_dir, store) = temp_store();
        let (sink, writer) = QueuedQuoteSink::start(store.clone(), 8).unwrap();

        // no table yet
        sink.append(quote("SBER", 1)).unwrap();
        drop(sink);
        let report = writer.join().unwrap();

        assert_eq!(report, WriterReport { written: 0, failed: 1 });
    }

    #[test]
    fn writer_failures_are_visible_beside_pipeline_stats() {
        let (_dir, store) = temp_store();
        let (sink, writer) = QueuedQuoteSink::start(store, 8).unwrap();
        let writer_stats = sink.writer_stats();
        let pipeline = QuotePipeline::new(sink);

        // no table yet, so the insert fails after the record is queued
        pipeline.handle(
            r#"{"data":{"symbol":"SBER","time":1,"bid":1.0,"ask":1.1,"last_price":1.05,"volume":10}}"#,
        );
        let stats = pipeline.stats();
        drop(pipeline);
        let report = writer.join().unwrap();

        let ingest = stats.snapshot();
        assert_eq!(ingest.accepted, 1);
        assert_eq!(ingest.storage_errors, 0);
        assert_eq!(report, WriterReport { written: 0, failed: 1 });
        assert_eq!(writer_stats.snapshot(), report);
    }

    #[test]
    fn writer_stats_count_commits_while_running() {
        let (_dir, store) = temp_store();
        store.ensure_schema().unwrap();
        let (sink, writer) = QueuedQuoteSink::start(store, 8).unwrap();
        let writer_stats = sink.writer_stats();

        sink.append(quote("SBER", 1)).unwrap();
        sink.append(quote("GAZP", 2)).unwrap();
        drop(sink);
        writer.join().unwrap();

        assert_eq!(writer_stats.snapshot(), WriterReport { written: 2, failed: 0 });
    }

    #[test]
    fn queued_ensure_schema_delegates() {
        let (_dir, store) = temp_store();
        let (sink, writer) = QueuedQuoteSink::start(store.clone(), 8).unwrap();

        sink.ensure_schema().unwrap();
        sink.append(quote("SBER", 1)).unwrap();
        drop(sink);
        writer.join().unwrap();

        assert_eq!(store.row_count().unwrap(), 1);
    }
}
