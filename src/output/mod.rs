//! Output module for crawl reports and ledger statistics
//!
//! This module handles:
//! - Writing the JSON results file of a run
//! - Printing the console summary
//! - Reporting run-ledger statistics (`--stats`)

mod report;
pub mod stats;

pub use report::{format_report, print_report, write_results, OutputError, OutputResult};
pub use stats::{load_statistics, print_statistics, LedgerStatistics};
