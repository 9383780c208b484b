//! Statistics generation from the run ledger
//!
//! Backs the `--stats` flag: a snapshot of every run the ledger knows about.

use crate::crawler::FailureKind;
use crate::storage::{RunLedger, RunRecord, StorageResult};

/// Ledger statistics summary
#[derive(Debug, Clone)]
pub struct LedgerStatistics {
    /// Number of runs recorded
    pub total_runs: u64,

    /// Most recent run, if any
    pub latest_run: Option<RunRecord>,

    /// Page outcome counts by status, across all runs
    pub pages_by_status: Vec<(String, u64)>,

    /// Abandoned page counts by failure kind, across all runs
    pub failures_by_kind: Vec<(FailureKind, u64)>,

    /// Highest page recorded as completed
    pub highest_completed_page: Option<u32>,
}

impl LedgerStatistics {
    /// Total page outcomes recorded
    pub fn total_pages(&self) -> u64 {
        self.pages_by_status.iter().map(|(_, count)| count).sum()
    }
}

/// Loads statistics from the ledger
///
/// # Arguments
///
/// * `ledger` - The run ledger to query
pub fn load_statistics(ledger: &dyn RunLedger) -> StorageResult<LedgerStatistics> {
    let mut pages_by_status = ledger.count_pages_by_status()?;
    pages_by_status.sort_by(|a, b| b.1.cmp(&a.1));

    let mut failures_by_kind = ledger.count_failures_by_kind()?;
    failures_by_kind.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(LedgerStatistics {
        total_runs: ledger.count_runs()?,
        latest_run: ledger.get_latest_run()?,
        pages_by_status,
        failures_by_kind,
        highest_completed_page: ledger.highest_completed_page()?,
    })
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &LedgerStatistics) {
    println!("=== Run Ledger Statistics ===\n");

    println!("Overview:");
    println!("  Runs recorded: {}", stats.total_runs);
    match stats.highest_completed_page {
        Some(page) => println!("  Highest completed page: {}", page),
        None => println!("  Highest completed page: none"),
    }
    println!();

    if let Some(run) = &stats.latest_run {
        println!("Latest Run (#{}):", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        if let Some(outcome) = &run.outcome {
            println!("  Outcome: {}", outcome);
        }
        println!(
            "  Pages: {} ok, {} abandoned",
            run.pages_succeeded, run.pages_abandoned
        );
        println!(
            "  Records: {} persisted, {} duplicates",
            run.records_persisted, run.records_duplicated
        );
        println!();
    }

    let total = stats.total_pages();
    if total > 0 {
        println!("Pages by Outcome:");
        for (status, count) in &stats.pages_by_status {
            let percentage = (*count as f64 / total as f64) * 100.0;
            println!("  {}: {} ({:.1}%)", status, count, percentage);
        }
        println!();
    }

    if !stats.failures_by_kind.is_empty() {
        println!("Abandonments by Failure Kind:");
        for (kind, count) in &stats.failures_by_kind {
            println!("  {}: {}", kind, count);
        }
        println!();
    }
}
