//! Crawl orchestration - the per-page fetch, extract, persist loop
//!
//! The [`Orchestrator`] owns every piece of mutable crawl state through a
//! [`CrawlContext`] and walks the category one page at a time:
//!
//! 1. Ask the [`PaginationCursor`] which page is next
//! 2. Acquire a session, wait for a rate-limit slot, send the request
//! 3. Classify the response and let the [`RetryPolicy`] drive any retries
//! 4. Extract records and persist them through the [`DeduplicationStore`]
//! 5. Record the page in the run ledger, then advance the cursor
//!
//! The stop signal is checked only between pages.

use crate::config::Config;
use crate::crawler::detector::{BlockDetector, Classification};
use crate::crawler::extractor::{ExtractedPage, Extractor, ListingExtractor};
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::retry::{FailureKind, RetryDecision, RetryEpisode, RetryPolicy};
use crate::crawler::session::{Session, SessionOutcome, SessionPool};
use crate::crawler::transport::{PageRequest, ReqwestTransport, Transport};
use crate::state::{CheckpointStore, CursorPhase, DoneReason, PaginationCursor};
use crate::storage::{
    open_ledger, CsvRecordStore, DeduplicationStore, PageOutcomeRecord, RunLedger, RunStatus,
    RunSummary, SqliteLedger,
};
use crate::url::{build_page_url, parse_base_url};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Pages between progress log lines
const PROGRESS_INTERVAL: u32 = 5;

/// Cooperative cancellation flag shared with the caller
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop before the next page
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a crawl ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum CrawlOutcome {
    /// Pagination finished normally
    Done(String),

    /// Pagination could not make further progress
    Failed(String),

    /// The per-run page budget was used up
    MaxPagesReached,

    /// The stop signal was raised
    Cancelled,
}

impl CrawlOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Status stored on the ledger's run row
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Done(_) => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
            Self::MaxPagesReached | Self::Cancelled => RunStatus::Interrupted,
        }
    }
}

impl fmt::Display for CrawlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done(reason) => write!(f, "done ({})", reason),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            Self::MaxPagesReached => write!(f, "max pages reached"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Accounting for one call to [`Orchestrator::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    pub run_id: i64,
    pub outcome: CrawlOutcome,
    pub started_at: DateTime<Utc>,
    pub first_page_visited: Option<u32>,
    pub last_page_visited: Option<u32>,
    pub last_completed_page: Option<u32>,
    pub total_pages_known: Option<u32>,
    pub pages_succeeded: u32,
    pub pages_abandoned: u32,
    pub abandoned_pages: Vec<u32>,
    pub records_found: u64,
    pub records_persisted: u64,
    pub records_duplicated: u64,
    pub records_failed: u64,
    pub sessions_created: u64,
    pub sessions_retired: u64,
    pub blocks_seen: u64,
    pub elapsed_secs: f64,
}

impl CrawlReport {
    fn new(run_id: i64) -> Self {
        Self {
            run_id,
            outcome: CrawlOutcome::Cancelled,
            started_at: Utc::now(),
            first_page_visited: None,
            last_page_visited: None,
            last_completed_page: None,
            total_pages_known: None,
            pages_succeeded: 0,
            pages_abandoned: 0,
            abandoned_pages: Vec::new(),
            records_found: 0,
            records_persisted: 0,
            records_duplicated: 0,
            records_failed: 0,
            sessions_created: 0,
            sessions_retired: 0,
            blocks_seen: 0,
            elapsed_secs: 0.0,
        }
    }

    fn visit(&mut self, page: u32) {
        self.first_page_visited.get_or_insert(page);
        self.last_page_visited = Some(page);
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            pages_succeeded: self.pages_succeeded,
            pages_abandoned: self.pages_abandoned,
            records_persisted: self.records_persisted,
            records_duplicated: self.records_duplicated,
        }
    }
}

/// Mutable crawl state the orchestrator threads through every request
#[derive(Debug)]
pub struct CrawlContext {
    pub rate_limiter: RateLimiter,
    pub sessions: SessionPool,
    pub retry: RetryPolicy,
    pub detector: BlockDetector,
}

impl CrawlContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            sessions: SessionPool::new(config.session.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            detector: BlockDetector::new(&config.detection),
        }
    }
}

/// A page that produced extractable content
struct FetchedPage {
    extracted: ExtractedPage,
    attempts: u32,
}

/// A page the retry policy gave up on
struct AbandonedFetch {
    kind: FailureKind,
    reason: String,
    attempts: u32,
}

/// Main crawl orchestrator
pub struct Orchestrator {
    config: Arc<Config>,
    context: CrawlContext,
    transport: Arc<dyn Transport>,
    extractor: Box<dyn Extractor>,
    store: Box<dyn DeduplicationStore>,
    ledger: SqliteLedger,
    cursor: PaginationCursor,
    base_url: Url,
    run_id: i64,
    referer: Option<String>,
}

impl Orchestrator {
    /// Creates an orchestrator from prepared collaborators
    ///
    /// An interrupted (`running`) run in the ledger is resumed under its id;
    /// otherwise a new run is created.
    ///
    /// # Arguments
    ///
    /// * `config` - The crawl configuration
    /// * `config_hash` - Hash recorded with a newly created run
    /// * `transport` - Sends page requests
    /// * `extractor` - Turns page bodies into records
    /// * `store` - Durable record output with its dedup ledger
    /// * `ledger` - Run ledger
    pub fn new(
        config: Config,
        config_hash: &str,
        transport: Arc<dyn Transport>,
        extractor: Box<dyn Extractor>,
        store: Box<dyn DeduplicationStore>,
        mut ledger: SqliteLedger,
    ) -> Result<Self, HarvestError> {
        let base_url = parse_base_url(&config.target.base_url)?;

        let run_id = match ledger.get_latest_run()? {
            Some(run) if matches!(run.status, RunStatus::Running) => {
                info!("Resuming interrupted run {}", run.id);
                run.id
            }
            _ => {
                let id = ledger.create_run(config_hash)?;
                info!("Starting new run {}", id);
                id
            }
        };

        let cursor = PaginationCursor::new(
            CheckpointStore::new(&config.output.checkpoint_path),
            &config.crawl,
        );

        Ok(Self {
            context: CrawlContext::from_config(&config),
            config: Arc::new(config),
            transport,
            extractor,
            store,
            ledger,
            cursor,
            base_url,
            run_id,
            referer: None,
        })
    }

    /// Wires up the production collaborators named by the configuration
    ///
    /// # Arguments
    ///
    /// * `config` - The crawl configuration
    /// * `config_hash` - Hash of the configuration file
    /// * `fresh` - Clear the record store, checkpoint and run ledger first
    pub fn from_config(config: Config, config_hash: &str, fresh: bool) -> Result<Self, HarvestError> {
        let records_path = Path::new(&config.output.records_path);
        let checkpoint = CheckpointStore::new(&config.output.checkpoint_path);
        let mut ledger = open_ledger(Path::new(&config.output.ledger_path))?;

        let store = if fresh {
            info!("Fresh start requested, clearing records, checkpoint and run ledger");
            checkpoint.clear()?;
            ledger.clear()?;
            CsvRecordStore::create_fresh(records_path)?
        } else {
            CsvRecordStore::open(records_path)?
        };
        info!(
            "Record store {} holds {} records",
            records_path.display(),
            store.len()
        );

        let transport = Arc::new(ReqwestTransport::new(config.transport.clone()));
        let extractor = ListingExtractor::from_config(&config.target)?;

        Self::new(
            config,
            config_hash,
            transport,
            Box::new(extractor),
            Box::new(store),
            ledger,
        )
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    pub fn context(&self) -> &CrawlContext {
        &self.context
    }

    /// Runs the crawl until it is done, fails, hits `max_pages`, or is stopped
    ///
    /// # Arguments
    ///
    /// * `start_page` - Page to start from instead of the resume position
    /// * `max_pages` - Maximum pages to visit in this call
    /// * `stop` - Checked between pages
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlReport)` - The crawl ended in one of its four outcomes
    /// * `Err(HarvestError)` - Progress could no longer be tracked (checkpoint
    ///   or ledger write failed)
    pub async fn run(
        &mut self,
        start_page: Option<u32>,
        max_pages: Option<u32>,
        stop: &StopSignal,
    ) -> Result<CrawlReport, HarvestError> {
        let start_time = Instant::now();
        let mut report = CrawlReport::new(self.run_id);

        let ledger_completed = self.ledger.highest_completed_page()?;
        let store_completed = self.store.highest_complete_page();
        self.cursor.start(start_page, ledger_completed.max(store_completed))?;
        info!(
            "Crawl run {} starting at page {}",
            self.run_id,
            self.cursor.current_page()
        );

        let mut pages_visited = 0u32;
        let outcome = loop {
            match self.cursor.phase() {
                CursorPhase::Done => {
                    let reason = self
                        .cursor
                        .done_reason()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "finished".to_string());
                    break CrawlOutcome::Done(reason);
                }
                CursorPhase::Failed => {
                    let reason = self.cursor.failure_reason().unwrap_or("failed").to_string();
                    break CrawlOutcome::Failed(reason);
                }
                _ => {}
            }

            if max_pages.is_some_and(|max| pages_visited >= max) {
                break CrawlOutcome::MaxPagesReached;
            }
            if stop.is_stopped() {
                info!("Stop requested, ending crawl before page {}", self.cursor.current_page());
                break CrawlOutcome::Cancelled;
            }

            let page = self.cursor.current_page();
            report.visit(page);
            self.crawl_page(page, &mut report).await?;
            pages_visited += 1;

            if pages_visited % PROGRESS_INTERVAL == 0 {
                info!(
                    "Progress: {} pages ok, {} abandoned, {} records persisted, {} duplicates",
                    report.pages_succeeded,
                    report.pages_abandoned,
                    report.records_persisted,
                    report.records_duplicated
                );
            }
        };

        report.outcome = outcome;
        report.last_completed_page = self.cursor.last_completed_page();
        report.total_pages_known = self.cursor.total_pages_known();
        report.sessions_created = self.context.sessions.sessions_created();
        report.sessions_retired = self.context.sessions.sessions_retired();
        report.elapsed_secs = start_time.elapsed().as_secs_f64();

        self.ledger.finish_run(
            self.run_id,
            report.outcome.run_status(),
            &report.outcome.to_string(),
            &report.summary(),
        )?;

        info!(
            "Crawl {}: {} pages ok, {} abandoned, {} records persisted in {:.1}s",
            report.outcome,
            report.pages_succeeded,
            report.pages_abandoned,
            report.records_persisted,
            report.elapsed_secs
        );

        Ok(report)
    }

    /// Fetches, persists and commits a single page
    async fn crawl_page(&mut self, page: u32, report: &mut CrawlReport) -> Result<(), HarvestError> {
        let url = build_page_url(
            &self.base_url,
            &self.config.target.page_param,
            self.config.target.ref_param.as_deref(),
            page,
        );
        debug!(page, url = %url, "Fetching page");

        let fetched = match self.fetch_page(page, &url, report).await? {
            Ok(fetched) => fetched,
            Err(abandoned) => {
                let mut outcome =
                    PageOutcomeRecord::abandoned(page, abandoned.kind, abandoned.reason.clone());
                outcome.attempts = abandoned.attempts;
                return self.abandon_page(outcome, &abandoned.reason, report);
            }
        };
        self.referer = Some(url.to_string());

        let extracted = fetched.extracted;
        self.cursor.begin_validation()?;
        let end = self.cursor.validate(&extracted)?;

        let found = extracted.records.len() as u32;
        let persisted = self.store.persist_page(page, &extracted.records);
        report.records_found += u64::from(found);
        report.records_persisted += u64::from(persisted.written);
        report.records_duplicated += u64::from(persisted.duplicates);
        report.records_failed += persisted.failed.len() as u64;

        let receipt = match persisted.receipt {
            Some(receipt) => receipt,
            None => {
                let message = format!(
                    "{} of {} records failed to persist",
                    persisted.failed.len(),
                    found
                );
                let mut outcome =
                    PageOutcomeRecord::abandoned(page, FailureKind::StorageWriteFailure, &message);
                outcome.attempts = fetched.attempts;
                outcome.records_found = found;
                outcome.records_persisted = persisted.written;
                outcome.records_duplicated = persisted.duplicates;
                outcome.records_failed = persisted.failed.len() as u32;
                return self.abandon_page(outcome, &message, report);
            }
        };

        let end_of_results = matches!(
            end,
            Some(DoneReason::NoNextPage | DoneReason::NoRecords)
        );
        let mut outcome = PageOutcomeRecord::completed(page, end_of_results);
        outcome.attempts = fetched.attempts;
        outcome.records_found = found;
        outcome.records_persisted = persisted.written;
        outcome.records_duplicated = persisted.duplicates;
        self.ledger.record_page(self.run_id, &outcome)?;

        self.cursor.advance(receipt)?;
        report.pages_succeeded += 1;

        info!(
            page,
            found,
            new = persisted.written,
            duplicates = persisted.duplicates,
            "Page complete"
        );
        Ok(())
    }

    fn abandon_page(
        &mut self,
        outcome: PageOutcomeRecord,
        reason: &str,
        report: &mut CrawlReport,
    ) -> Result<(), HarvestError> {
        let page = outcome.page_number;
        warn!(
            page,
            kind = ?outcome.failure_kind,
            attempts = outcome.attempts,
            "Abandoning page: {}",
            reason
        );

        self.ledger.record_page(self.run_id, &outcome)?;
        if outcome.failure_kind == Some(FailureKind::StorageWriteFailure) {
            // An unpersisted page is never skipped
            self.cursor.fail_page(reason)?;
        } else {
            self.cursor.abandon(reason)?;
        }
        report.pages_abandoned += 1;
        report.abandoned_pages.push(page);
        Ok(())
    }

    /// Requests a page until it yields records or the retry policy gives up
    ///
    /// The outer `Result` carries infrastructure faults; the inner one says
    /// whether the page produced content.
    async fn fetch_page(
        &mut self,
        page: u32,
        url: &Url,
        report: &mut CrawlReport,
    ) -> Result<Result<FetchedPage, AbandonedFetch>, HarvestError> {
        let mut episode = RetryEpisode::new();
        let mut backoff = Duration::ZERO;

        loop {
            if !backoff.is_zero() {
                debug!(page, delay_ms = backoff.as_millis() as u64, "Backing off");
                tokio::time::sleep(backoff).await;
            }

            let session = self.context.sessions.acquire()?;
            self.context.rate_limiter.wait_for_slot().await;

            let request = PageRequest {
                url: url.to_string(),
                referer: self.referer.clone(),
                proxy: self.config.transport.proxy_url.clone(),
            };
            let attempt = episode.attempts() + 1;
            debug!(page, session_id = session.id, attempt, "Sending request");

            let (kind, detail) = match self.transport.send(&session, &request).await {
                Err(e) => (FailureKind::TransientNetwork, e.to_string()),
                Ok(response) => match self.context.detector.classify(&response) {
                    Classification::Ok => match self.extractor.extract(&response.body, page) {
                        Ok(extracted) => {
                            self.release_session(session, SessionOutcome::Success).await;
                            return Ok(Ok(FetchedPage {
                                extracted,
                                attempts: attempt,
                            }));
                        }
                        Err(e) => (FailureKind::ExtractionFailure, e.to_string()),
                    },
                    other => {
                        let kind = other
                            .failure_kind()
                            .unwrap_or(FailureKind::MalformedResponse);
                        if kind.is_block() {
                            report.blocks_seen += 1;
                        }
                        (kind, format!("HTTP {}", response.status))
                    }
                },
            };

            let session_id = session.id;
            self.release_session(session, SessionOutcome::from(kind)).await;

            match self.context.retry.decide(&mut episode, kind) {
                RetryDecision::Retry {
                    delay,
                    rotate_session,
                } => {
                    warn!(
                        page,
                        session_id,
                        attempt,
                        kind = %kind,
                        rotate_session,
                        "Request failed ({}), retrying",
                        detail
                    );
                    backoff = delay;
                }
                RetryDecision::Abandon { kind, reason } => {
                    return Ok(Err(AbandonedFetch {
                        kind,
                        reason: format!("{} (last: {})", reason, detail),
                        attempts: episode.attempts(),
                    }));
                }
            }
        }
    }

    async fn release_session(&mut self, session: Session, outcome: SessionOutcome) {
        let id = session.id;
        if self.context.sessions.release(session, outcome) {
            self.transport.forget_session(id).await;
        }
    }
}
