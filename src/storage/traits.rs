//! Storage traits and error types
//!
//! [`DeduplicationStore`] is the seam between the orchestrator and the durable
//! record store. [`RunLedger`] is the interface of the SQLite run ledger.

use crate::crawler::FailureKind;
use crate::storage::record::Record;
use crate::storage::{PageOutcomeRecord, RunRecord, RunStatus, RunSummary};
use thiserror::Error;
use tracing::error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Record store schema mismatch: expected [{expected}], found [{found}]")]
    SchemaMismatch { expected: String, found: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record store refuses writes after a failed rollback: {0}")]
    Poisoned(String),

    #[error("Checkpoint is corrupt: {0}")]
    CorruptCheckpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result of persisting one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The record was durably written
    Written,
    /// The id was already in the ledger; nothing was written
    Duplicate,
}

/// Proof that every record of a page is durable
///
/// Only [`DeduplicationStore::persist_page`] creates receipts, and only when no
/// record of the page failed to persist. Advancing the pagination cursor
/// requires one.
#[derive(Debug, PartialEq, Eq)]
pub struct PersistReceipt {
    page_number: u32,
}

impl PersistReceipt {
    pub(crate) fn new(page_number: u32) -> Self {
        Self { page_number }
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }
}

/// Per-page persistence accounting
#[derive(Debug)]
pub struct PagePersistReport {
    pub written: u32,
    pub duplicates: u32,

    /// Ids whose write failed, with the error message
    pub failed: Vec<(String, String)>,

    /// Present only when `failed` is empty
    pub receipt: Option<PersistReceipt>,
}

/// Durable ledger of seen record ids plus the record output itself
///
/// Once `persist` returns `Ok`, `is_new` for that id returns false, also
/// after a restart.
pub trait DeduplicationStore: Send {
    /// Whether no record with this id has been persisted
    fn is_new(&self, unique_id: &str) -> bool;

    /// Durably writes a record unless its id was already persisted
    fn persist(&mut self, record: &Record) -> StorageResult<PersistOutcome>;

    /// Number of distinct ids in the ledger
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest page whose completion marker is durably in the store
    ///
    /// Lets a restart skip a page whose records all landed even when the
    /// checkpoint and run ledger never heard about it.
    fn highest_complete_page(&self) -> Option<u32>;

    /// Persists all records of a page, one durable write at a time
    ///
    /// A record that fails to persist is reported and skipped. The last new
    /// record of the page carries the completion marker, so it reaches disk
    /// in the same write as the row itself. The marker is dropped once any
    /// earlier record of the page has failed. The returned report carries a
    /// receipt only if nothing failed.
    fn persist_page(&mut self, page_number: u32, records: &[Record]) -> PagePersistReport {
        let mut report = PagePersistReport {
            written: 0,
            duplicates: 0,
            failed: Vec::new(),
            receipt: None,
        };

        let last_new = records.iter().rposition(|r| self.is_new(&r.unique_id));

        for (index, record) in records.iter().enumerate() {
            if !self.is_new(&record.unique_id) {
                report.duplicates += 1;
                continue;
            }

            let result = if Some(index) == last_new && report.failed.is_empty() {
                let mut closing = record.clone();
                closing.page_complete = true;
                self.persist(&closing)
            } else {
                self.persist(record)
            };

            match result {
                Ok(PersistOutcome::Written) => report.written += 1,
                Ok(PersistOutcome::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    error!(
                        page = page_number,
                        unique_id = %record.unique_id,
                        "Failed to persist record: {}",
                        e
                    );
                    report.failed.push((record.unique_id.clone(), e.to_string()));
                }
            }
        }

        if report.failed.is_empty() {
            report.receipt = Some(PersistReceipt::new(page_number));
        }

        report
    }
}

/// Trait for the run ledger backend
pub trait RunLedger {
    // ===== Run Management =====

    /// Creates a new run in the `running` state
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Updates the status of a run
    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// Marks a run finished with its final status, outcome and counters
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        outcome: &str,
        summary: &RunSummary,
    ) -> StorageResult<()>;

    // ===== Page Outcomes =====

    /// Records how a page ended
    fn record_page(&mut self, run_id: i64, outcome: &PageOutcomeRecord) -> StorageResult<()>;

    /// Gets the outcomes recorded for a run, ordered by page
    fn get_page_outcomes(&self, run_id: i64) -> StorageResult<Vec<PageOutcomeRecord>>;

    /// Highest page recorded as completed in any run
    fn highest_completed_page(&self) -> StorageResult<Option<u32>>;

    // ===== Statistics =====

    /// Number of runs in the ledger
    fn count_runs(&self) -> StorageResult<u64>;

    /// Counts of page outcomes by status across all runs
    fn count_pages_by_status(&self) -> StorageResult<Vec<(String, u64)>>;

    /// Counts of abandoned pages by failure kind across all runs
    fn count_failures_by_kind(&self) -> StorageResult<Vec<(FailureKind, u64)>>;

    /// Removes every run and page outcome
    fn clear(&mut self) -> StorageResult<()>;
}
