//! Storage module for persisting crawl data
//!
//! This module handles every durable write of the crawler:
//! - The CSV record store, which doubles as the deduplication ledger
//! - The SQLite run ledger (runs and per-page outcomes)
//! - Run tracking and resumption support

mod csv_store;
mod record;
mod schema;
mod sqlite;
mod traits;

pub use csv_store::CsvRecordStore;
pub use record::{Record, RECORD_COLUMNS, RECORD_SCHEMA_VERSION};
pub use sqlite::SqliteLedger;
pub use traits::{
    DeduplicationStore, PagePersistReport, PersistOutcome, PersistReceipt, RunLedger,
    StorageError, StorageResult,
};

use crate::crawler::FailureKind;
use crate::HarvestError;
use std::path::Path;

/// Opens (or creates) the run ledger database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteLedger)` - Successfully initialized ledger
/// * `Err(HarvestError)` - Failed to open or initialize the database
pub fn open_ledger(path: &Path) -> Result<SqliteLedger, HarvestError> {
    SqliteLedger::new(path)
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub outcome: Option<String>,
    pub pages_succeeded: u32,
    pub pages_abandoned: u32,
    pub records_persisted: u64,
    pub records_duplicated: u64,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// How a page ended within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Records persisted, more pages follow
    Completed,
    /// Records persisted and the page signalled the end of the category
    EndOfResults,
    /// Retries exhausted or records could not be persisted
    Abandoned,
}

impl PageStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::EndOfResults => "end_of_results",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "end_of_results" => Some(Self::EndOfResults),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Whether the page's records are all durable
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed | Self::EndOfResults)
    }
}

/// Ledger row describing one page of one run
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcomeRecord {
    pub page_number: u32,
    pub status: PageStatus,
    pub records_found: u32,
    pub records_persisted: u32,
    pub records_duplicated: u32,
    pub records_failed: u32,
    pub failure_kind: Option<FailureKind>,
    pub attempts: u32,
    pub message: Option<String>,
}

impl PageOutcomeRecord {
    /// Outcome of a page whose records were all persisted
    pub fn completed(page_number: u32, end_of_results: bool) -> Self {
        Self {
            page_number,
            status: if end_of_results {
                PageStatus::EndOfResults
            } else {
                PageStatus::Completed
            },
            records_found: 0,
            records_persisted: 0,
            records_duplicated: 0,
            records_failed: 0,
            failure_kind: None,
            attempts: 1,
            message: None,
        }
    }

    /// Outcome of an abandoned page
    pub fn abandoned(page_number: u32, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            page_number,
            status: PageStatus::Abandoned,
            records_found: 0,
            records_persisted: 0,
            records_duplicated: 0,
            records_failed: 0,
            failure_kind: Some(kind),
            attempts: 1,
            message: Some(message.into()),
        }
    }
}

/// Counters written to the `runs` row when a run finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages_succeeded: u32,
    pub pages_abandoned: u32,
    pub records_persisted: u64,
    pub records_duplicated: u64,
}
