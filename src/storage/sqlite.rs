//! SQLite run ledger
//!
//! This module provides the SQLite implementation of the [`RunLedger`] trait.

use crate::crawler::FailureKind;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{RunLedger, StorageError, StorageResult};
use crate::storage::{PageOutcomeRecord, PageStatus, RunRecord, RunStatus, RunSummary};
use crate::HarvestError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, status, outcome, \
     pages_succeeded, pages_abandoned, records_persisted, records_duplicated";

/// SQLite run ledger backend
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Opens or creates the ledger database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteLedger)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // FULL: a page row must be durable before the checkpoint is written
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Interrupted),
        outcome: row.get(5)?,
        pages_succeeded: row.get(6)?,
        pages_abandoned: row.get(7)?,
        records_persisted: row.get::<_, i64>(8)? as u64,
        records_duplicated: row.get::<_, i64>(9)? as u64,
    })
}

impl RunLedger for SqliteLedger {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![run_id], run_from_row)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS);
        let run = self.conn.query_row(&sql, [], run_from_row).optional()?;
        Ok(run)
    }

    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), run_id],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        outcome: &str,
        summary: &RunSummary,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, outcome = ?3,
             pages_succeeded = pages_succeeded + ?4, pages_abandoned = pages_abandoned + ?5,
             records_persisted = records_persisted + ?6,
             records_duplicated = records_duplicated + ?7
             WHERE id = ?8",
            params![
                status.to_db_string(),
                now,
                outcome,
                summary.pages_succeeded,
                summary.pages_abandoned,
                summary.records_persisted as i64,
                summary.records_duplicated as i64,
                run_id
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Page Outcomes =====

    fn record_page(&mut self, run_id: i64, outcome: &PageOutcomeRecord) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO page_outcomes (run_id, page_number, status, records_found,
             records_persisted, records_duplicated, records_failed, failure_kind, attempts,
             message, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                outcome.page_number,
                outcome.status.to_db_string(),
                outcome.records_found,
                outcome.records_persisted,
                outcome.records_duplicated,
                outcome.records_failed,
                outcome.failure_kind.map(|k| k.as_str()),
                outcome.attempts,
                outcome.message,
                now
            ],
        )?;
        Ok(())
    }

    fn get_page_outcomes(&self, run_id: i64) -> StorageResult<Vec<PageOutcomeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT page_number, status, records_found, records_persisted, records_duplicated,
             records_failed, failure_kind, attempts, message
             FROM page_outcomes WHERE run_id = ?1 ORDER BY page_number, id",
        )?;

        let outcomes = stmt
            .query_map(params![run_id], |row| {
                let status: String = row.get(1)?;
                let kind: Option<String> = row.get(6)?;
                Ok(PageOutcomeRecord {
                    page_number: row.get(0)?,
                    status: PageStatus::from_db_string(&status).unwrap_or(PageStatus::Abandoned),
                    records_found: row.get(2)?,
                    records_persisted: row.get(3)?,
                    records_duplicated: row.get(4)?,
                    records_failed: row.get(5)?,
                    failure_kind: kind.as_deref().and_then(FailureKind::from_db_string),
                    attempts: row.get(7)?,
                    message: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(outcomes)
    }

    fn highest_completed_page(&self) -> StorageResult<Option<u32>> {
        let page: Option<u32> = self.conn.query_row(
            "SELECT MAX(page_number) FROM page_outcomes WHERE status IN (?1, ?2)",
            params![
                PageStatus::Completed.to_db_string(),
                PageStatus::EndOfResults.to_db_string()
            ],
            |row| row.get(0),
        )?;
        Ok(page)
    }

    // ===== Statistics =====

    fn count_runs(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_pages_by_status(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM page_outcomes GROUP BY status ORDER BY status",
        )?;

        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    fn count_failures_by_kind(&self) -> StorageResult<Vec<(FailureKind, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT failure_kind, COUNT(*) FROM page_outcomes
             WHERE status = ?1 AND failure_kind IS NOT NULL
             GROUP BY failure_kind ORDER BY COUNT(*) DESC",
        )?;

        let rows = stmt.query_map(params![PageStatus::Abandoned.to_db_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (kind, count) = row?;
            if let Some(kind) = FailureKind::from_db_string(&kind) {
                counts.push((kind, count as u64));
            }
        }

        Ok(counts)
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.conn
            .execute_batch("DELETE FROM page_outcomes; DELETE FROM runs;")?;
        Ok(())
    }
}
