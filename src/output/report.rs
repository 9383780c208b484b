//! Crawl report output
//!
//! Writes the [`CrawlReport`] of a run as JSON and renders the console summary.

use crate::crawler::CrawlReport;
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while writing the report
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Writes the report as pretty-printed JSON, creating parent directories
///
/// # Arguments
///
/// * `report` - The report to write
/// * `path` - Destination file; replaced if it exists
pub fn write_results(report: &CrawlReport, path: &Path) -> OutputResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;

    info!("Run results written to {}", path.display());
    Ok(())
}

/// Renders the human-readable summary
pub fn format_report(report: &CrawlReport) -> String {
    let mut out = String::new();
    let page = |p: Option<u32>| p.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());

    let _ = writeln!(out, "=== Crawl Report (run #{}) ===", report.run_id);
    let _ = writeln!(out, "Outcome: {}", report.outcome);
    let _ = writeln!(out, "Elapsed: {}", format_duration(report.elapsed_secs));
    let _ = writeln!(out);

    let _ = writeln!(out, "Pages:");
    let _ = writeln!(
        out,
        "  Visited: {} .. {}",
        page(report.first_page_visited),
        page(report.last_page_visited)
    );
    let _ = writeln!(out, "  Last completed: {}", page(report.last_completed_page));
    if let Some(total) = report.total_pages_known {
        let _ = writeln!(out, "  Known total: {}", total);
    }
    let _ = writeln!(out, "  Succeeded: {}", report.pages_succeeded);
    let _ = writeln!(out, "  Abandoned: {}", report.pages_abandoned);
    if !report.abandoned_pages.is_empty() {
        let list: Vec<String> = report.abandoned_pages.iter().map(u32::to_string).collect();
        let _ = writeln!(out, "  Abandoned pages: {}", list.join(", "));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Records:");
    let _ = writeln!(out, "  Found: {}", report.records_found);
    let _ = writeln!(out, "  Persisted: {}", report.records_persisted);
    let _ = writeln!(out, "  Duplicates dropped: {}", report.records_duplicated);
    if report.records_failed > 0 {
        let _ = writeln!(out, "  Failed writes: {}", report.records_failed);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Sessions:");
    let _ = writeln!(out, "  Created: {}", report.sessions_created);
    let _ = writeln!(out, "  Retired: {}", report.sessions_retired);
    let _ = writeln!(out, "  Blocks seen: {}", report.blocks_seen);

    out
}

/// Prints the summary to stdout
pub fn print_report(report: &CrawlReport) {
    print!("{}", format_report(report));
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{:.1}s", secs)
    }
}
