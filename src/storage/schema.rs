//! Database schema definitions for the run ledger

/// SQL schema for the ledger database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    outcome TEXT,
    pages_succeeded INTEGER NOT NULL DEFAULT 0,
    pages_abandoned INTEGER NOT NULL DEFAULT 0,
    records_persisted INTEGER NOT NULL DEFAULT 0,
    records_duplicated INTEGER NOT NULL DEFAULT 0
);

-- One row per page attempt outcome
CREATE TABLE IF NOT EXISTS page_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    page_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    records_found INTEGER NOT NULL DEFAULT 0,
    records_persisted INTEGER NOT NULL DEFAULT 0,
    records_duplicated INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    failure_kind TEXT,
    attempts INTEGER NOT NULL DEFAULT 1,
    message TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_page_outcomes_run ON page_outcomes(run_id);
CREATE INDEX IF NOT EXISTS idx_page_outcomes_status ON page_outcomes(status);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
