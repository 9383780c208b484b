//! Pagination cursor state machine
//!
//! The cursor walks `Init -> Fetching -> Validating -> Advancing` for every
//! page and ends in `Done` or `Failed`. Progress only moves forward through
//! [`PaginationCursor::advance`], which demands the [`PersistReceipt`] issued
//! once every record of the page is durable, and writes the checkpoint before
//! the page counter moves.

use super::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::CrawlConfig;
use crate::crawler::ExtractedPage;
use crate::storage::{PersistReceipt, StorageError};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Phase of the pagination state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorPhase {
    /// Checkpoint not yet loaded
    Init,

    /// Waiting for the orchestrator to fetch the current page
    Fetching,

    /// A response arrived and its extracted content is being judged
    Validating,

    /// The page was judged; waiting for its persist receipt
    Advancing,

    // ===== Terminal =====
    Done,
    Failed,
}

impl CursorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Advancing => "advancing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CursorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why pagination finished normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// The page had no enabled next-page link
    NoNextPage,

    /// A valid page carried zero records
    NoRecords,

    /// The configured page cap was reached
    PageCap,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoNextPage => "no next page",
            Self::NoRecords => "page returned zero records",
            Self::PageCap => "page cap reached",
        };
        write!(f, "{}", text)
    }
}

/// Cursor misuse or checkpoint failure
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("Invalid cursor transition from {from} to {to}")]
    InvalidTransition { from: CursorPhase, to: CursorPhase },

    #[error("Persist receipt for page {got} does not match current page {expected}")]
    ReceiptMismatch { expected: u32, got: u32 },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] StorageError),
}

/// Tracks the current page, the last durable page, and termination
#[derive(Debug)]
pub struct PaginationCursor {
    phase: CursorPhase,
    current_page: u32,
    last_completed_page: u32,
    total_pages_known: Option<u32>,
    abandoned_pages: Vec<u32>,
    consecutive_failures: u32,
    page_cap: Option<u32>,
    tolerate_page_failures: bool,
    max_consecutive_failures: u32,
    pending_end: Option<DoneReason>,
    done_reason: Option<DoneReason>,
    failure_reason: Option<String>,
    checkpoint: CheckpointStore,
}

impl PaginationCursor {
    /// Creates a cursor in the `Init` phase
    ///
    /// Nothing is read from disk until [`start`](Self::start).
    pub fn new(checkpoint: CheckpointStore, config: &CrawlConfig) -> Self {
        Self {
            phase: CursorPhase::Init,
            current_page: 1,
            last_completed_page: 0,
            total_pages_known: None,
            abandoned_pages: Vec::new(),
            consecutive_failures: 0,
            page_cap: config.page_cap,
            tolerate_page_failures: config.tolerate_page_failures,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            pending_end: None,
            done_reason: None,
            failure_reason: None,
            checkpoint,
        }
    }

    /// Loads the checkpoint and positions the cursor on the first page to fetch
    ///
    /// # Arguments
    ///
    /// * `start_page` - Explicit starting page; overrides the resume position
    /// * `durable_completed` - Highest page known complete outside the
    ///   checkpoint (run ledger or record store)
    ///
    /// # Returns
    ///
    /// The resulting phase: `Fetching`, or `Done` when the resume position is
    /// already past the page cap.
    pub fn start(
        &mut self,
        start_page: Option<u32>,
        durable_completed: Option<u32>,
    ) -> Result<CursorPhase, CursorError> {
        self.expect_phase(CursorPhase::Init, CursorPhase::Fetching)?;

        if let Some(saved) = self.checkpoint.load()? {
            self.last_completed_page = saved.last_completed_page;
            self.total_pages_known = saved.total_pages_known;
            self.abandoned_pages = saved.abandoned_pages;
        }

        if let Some(durable_page) = durable_completed {
            if durable_page > self.last_completed_page {
                info!(
                    checkpoint = self.last_completed_page,
                    durable = durable_page,
                    "Persisted pages are ahead of checkpoint, resuming after them"
                );
                self.last_completed_page = durable_page;
            }
        }

        self.current_page = match start_page {
            Some(page) => page.max(1),
            None => self.last_completed_page + 1,
        };

        if let Some(reason) = self.limit_reached_before(self.current_page) {
            info!(page = self.current_page, %reason, "Nothing left to crawl");
            self.finish(reason);
            return Ok(self.phase);
        }

        debug!(
            page = self.current_page,
            last_completed = self.last_completed_page,
            "Cursor started"
        );
        self.phase = CursorPhase::Fetching;
        Ok(self.phase)
    }

    /// Marks that a usable response for the current page arrived
    pub fn begin_validation(&mut self) -> Result<(), CursorError> {
        self.expect_phase(CursorPhase::Fetching, CursorPhase::Validating)?;
        self.phase = CursorPhase::Validating;
        Ok(())
    }

    /// Inspects the extracted page for end-of-results and pagination hints
    ///
    /// # Returns
    ///
    /// `Some(reason)` when this page will be the last one once it is advanced.
    pub fn validate(&mut self, page: &ExtractedPage) -> Result<Option<DoneReason>, CursorError> {
        self.expect_phase(CursorPhase::Validating, CursorPhase::Advancing)?;

        if let Some(total) = page.total_pages {
            let known = self.total_pages_known.unwrap_or(0).max(total);
            self.total_pages_known = Some(known.max(self.current_page));
        }

        self.pending_end = if page.records.is_empty() {
            Some(DoneReason::NoRecords)
        } else if page.end_of_results {
            Some(DoneReason::NoNextPage)
        } else {
            self.limit_reached_before(self.current_page + 1)
        };

        self.phase = CursorPhase::Advancing;
        Ok(self.pending_end)
    }

    /// Commits the current page and moves to the next one
    ///
    /// The checkpoint is written before the page counter changes. A receipt
    /// for any other page is rejected.
    pub fn advance(&mut self, receipt: PersistReceipt) -> Result<CursorPhase, CursorError> {
        self.expect_phase(CursorPhase::Advancing, CursorPhase::Fetching)?;
        if receipt.page_number() != self.current_page {
            return Err(CursorError::ReceiptMismatch {
                expected: self.current_page,
                got: receipt.page_number(),
            });
        }

        let completed = self.current_page;
        let last_completed = self.last_completed_page.max(completed);
        let mut abandoned = self.abandoned_pages.clone();
        abandoned.retain(|p| *p != completed);

        self.checkpoint.save(&Checkpoint::new(
            last_completed,
            self.total_pages_known,
            abandoned.clone(),
        ))?;

        self.last_completed_page = last_completed;
        self.abandoned_pages = abandoned;
        self.consecutive_failures = 0;

        match self.pending_end.take() {
            Some(reason) => self.finish(reason),
            None => {
                self.current_page += 1;
                self.phase = CursorPhase::Fetching;
            }
        }
        Ok(self.phase)
    }

    /// Gives up on the current page
    ///
    /// Allowed from `Fetching`, `Validating` or `Advancing`. The crawl moves
    /// on to the next page when failures are tolerated and the consecutive
    /// failure limit has not been hit; otherwise the cursor fails.
    /// `last_completed_page` never moves here.
    pub fn abandon(&mut self, reason: &str) -> Result<CursorPhase, CursorError> {
        let page = self.record_abandoned()?;

        if !self.tolerate_page_failures {
            self.fail(format!("page {} abandoned: {}", page, reason));
        } else if self.consecutive_failures >= self.max_consecutive_failures {
            self.fail(format!(
                "{} consecutive pages abandoned, last was page {}: {}",
                self.consecutive_failures, page, reason
            ));
        } else if let Some(done) = self.limit_reached_before(page + 1) {
            self.finish(done);
        } else {
            warn!(page, reason, "Page abandoned, moving on");
            self.current_page = page + 1;
            self.phase = CursorPhase::Fetching;
        }
        Ok(self.phase)
    }

    /// Gives up on the current page and on the crawl
    ///
    /// Used when skipping the page would leave records behind it unpersisted.
    /// A later run resumes at this page.
    pub fn fail_page(&mut self, reason: &str) -> Result<CursorPhase, CursorError> {
        let page = self.record_abandoned()?;
        self.fail(format!("page {} could not be committed: {}", page, reason));
        Ok(self.phase)
    }

    fn record_abandoned(&mut self) -> Result<u32, CursorError> {
        if !matches!(
            self.phase,
            CursorPhase::Fetching | CursorPhase::Validating | CursorPhase::Advancing
        ) {
            return Err(CursorError::InvalidTransition {
                from: self.phase,
                to: CursorPhase::Failed,
            });
        }

        let page = self.current_page;
        if !self.abandoned_pages.contains(&page) {
            self.abandoned_pages.push(page);
        }
        self.consecutive_failures += 1;
        self.pending_end = None;

        self.checkpoint.save(&Checkpoint::new(
            self.last_completed_page,
            self.total_pages_known,
            self.abandoned_pages.clone(),
        ))?;
        Ok(page)
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    /// Highest page whose records are durable, if any
    pub fn last_completed_page(&self) -> Option<u32> {
        (self.last_completed_page > 0).then_some(self.last_completed_page)
    }

    pub fn total_pages_known(&self) -> Option<u32> {
        self.total_pages_known
    }

    pub fn abandoned_pages(&self) -> &[u32] {
        &self.abandoned_pages
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        self.done_reason
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Whether `next` lies beyond the page cap
    ///
    /// The advertised page count is informational and never ends the crawl.
    fn limit_reached_before(&self, next: u32) -> Option<DoneReason> {
        self.page_cap
            .is_some_and(|cap| next > cap)
            .then_some(DoneReason::PageCap)
    }

    fn finish(&mut self, reason: DoneReason) {
        info!(page = self.current_page, %reason, "Pagination done");
        self.done_reason = Some(reason);
        self.phase = CursorPhase::Done;
    }

    fn fail(&mut self, reason: String) {
        warn!(page = self.current_page, reason = %reason, "Pagination failed");
        self.failure_reason = Some(reason);
        self.phase = CursorPhase::Failed;
    }

    fn expect_phase(&self, expected: CursorPhase, to: CursorPhase) -> Result<(), CursorError> {
        if self.phase != expected {
            return Err(CursorError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        Ok(())
    }
}
