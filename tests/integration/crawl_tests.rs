//! Integration tests for the crawler
//!
//! Most tests drive the orchestrator through a scripted in-process transport
//! so failures, blocks and crashes can be staged page by page. The last test
//! uses wiremock to run a full crawl over real HTTP.

use async_trait::async_trait;
use listing_harvest::config::{parse_config, Config};
use listing_harvest::crawler::{
    Extractor, ListingExtractor, PageRequest, RawResponse, ReqwestTransport, Session, Transport,
    TransportError,
};
use listing_harvest::state::CheckpointStore;
use listing_harvest::storage::{
    CsvRecordStore, DeduplicationStore, PageOutcomeRecord, PersistOutcome, Record, RunLedger,
    SqliteLedger, StorageError, StorageResult,
};
use listing_harvest::url::page_number_in_url;
use listing_harvest::{CrawlOutcome, CursorPhase, Orchestrator, StopSignal};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const BASE_URL: &str = "https://shop.test/c/templates";

/// Creates a test configuration with millisecond delays and files under `dir`
fn create_test_config(dir: &Path, base_url: &str, extra: &str) -> Config {
    let path = |name: &str| dir.join(name).display().to_string();
    let toml = format!(
        r#"
[target]
base-url = "{base_url}"

[rate-limit]
min-delay-ms = 1
max-delay-ms = 3

[retry]
base-delay-ms = 1
max-delay-ms = 5
max-total-wait-ms = 1000
jitter = 0.0
soft-block-cooldown-min-ms = 1
soft-block-cooldown-max-ms = 2

[session]
pool-size = 2

[output]
records-path = "{records}"
checkpoint-path = "{checkpoint}"
ledger-path = "{ledger}"
results-path = "{results}"

{extra}
"#,
        records = path("records.csv"),
        checkpoint = path("checkpoint.json"),
        ledger = path("ledger.db"),
        results = path("results.json"),
    );
    parse_config(&toml).expect("test config should be valid")
}

fn listing_id(page: u32, index: u32) -> String {
    format!("{}", page * 1000 + index)
}

/// Renders a listing page with `count` cards
fn listing_page(page: u32, count: u32, has_next: bool) -> String {
    let cards: String = (1..=count)
        .map(|i| {
            let id = listing_id(page, i);
            format!(
                r#"<div class="v2-listing-card" data-listing-id="{id}">
                     <a href="/listing/{id}/item-{id}?ref=search"><h3>Item {id}</h3></a>
                     <div class="lc-price"><span class="currency-value">{i}.00</span></div>
                   </div>"#
            )
        })
        .collect();
    let next = if has_next {
        format!(
            r#"<a class="wt-pagination__item--next" href="/c/templates?page={}">Next</a>"#,
            page + 1
        )
    } else {
        String::new()
    };
    format!(
        r#"<html><body><div class="search-listings-group">{cards}</div>
           <nav class="wt-pagination">{next}</nav></body></html>"#
    )
}

fn challenge_page() -> RawResponse {
    RawResponse::new(403, "<html><body>Please complete the captcha</body></html>")
}

type Script = dyn Fn(u32, u32) -> Result<RawResponse, TransportError> + Send + Sync;

/// Transport answering from a script keyed by page number and call count
struct ScriptedTransport {
    script: Box<Script>,
    calls: Mutex<Vec<(u32, u64)>>,
}

impl ScriptedTransport {
    fn new(
        script: impl Fn(u32, u32) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A site of `pages` pages with `per_page` listings each
    fn site(pages: u32, per_page: u32) -> Arc<Self> {
        Self::new(move |page, _| {
            Ok(RawResponse::new(
                200,
                listing_page(page, per_page, page < pages),
            ))
        })
    }

    /// `(page, session_id)` for every request sent
    fn calls(&self) -> Vec<(u32, u64)> {
        self.calls.lock().unwrap().clone()
    }

    fn pages_requested(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.calls().into_iter().map(|(p, _)| p).collect();
        pages.dedup();
        pages
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        session: &Session,
        request: &PageRequest,
    ) -> Result<RawResponse, TransportError> {
        let url = Url::parse(&request.url).unwrap();
        let page = page_number_in_url(&url, "page").unwrap_or(1);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((page, session.id));
            calls.iter().filter(|(p, _)| *p == page).count() as u32
        };
        (self.script)(page, call)
    }
}

fn orchestrator(config: &Config, transport: Arc<dyn Transport>) -> Orchestrator {
    let store = CsvRecordStore::open(Path::new(&config.output.records_path)).unwrap();
    orchestrator_with_store(config, transport, Box::new(store))
}

fn orchestrator_with_store(
    config: &Config,
    transport: Arc<dyn Transport>,
    store: Box<dyn DeduplicationStore>,
) -> Orchestrator {
    let extractor = ListingExtractor::from_config(&config.target).unwrap();
    let ledger = SqliteLedger::new(Path::new(&config.output.ledger_path)).unwrap();
    Orchestrator::new(
        config.clone(),
        "test-hash",
        transport,
        Box::new(extractor),
        store,
        ledger,
    )
    .unwrap()
}

fn stored_records(config: &Config) -> Vec<Record> {
    CsvRecordStore::read_all(Path::new(&config.output.records_path)).unwrap()
}

fn assert_no_duplicate_ids(records: &[Record]) {
    let unique: HashSet<_> = records.iter().map(|r| r.unique_id.as_str()).collect();
    assert_eq!(unique.len(), records.len(), "record store holds duplicate ids");
}

fn checkpoint_page(config: &Config) -> u32 {
    CheckpointStore::new(&config.output.checkpoint_path)
        .load()
        .unwrap()
        .map(|c| c.last_completed_page)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_full_crawl_until_no_next_page() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::site(4, 3);

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Done("no next page".to_string()));
    assert_eq!(report.pages_succeeded, 4);
    assert_eq!(report.records_persisted, 12);
    assert_eq!(report.last_completed_page, Some(4));
    assert_eq!(transport.pages_requested(), vec![1, 2, 3, 4]);

    let records = stored_records(&config);
    assert_eq!(records.len(), 12);
    assert_eq!(records[0].unique_id, listing_id(1, 1));
    assert_eq!(records[0].url, "https://shop.test/listing/1001/item-1001");
    assert_eq!(records[11].page_number, 4);
    assert_eq!(checkpoint_page(&config), 4);
}

#[tokio::test]
async fn test_soft_block_rotates_session() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::new(|page, call| {
        if page == 1 && call == 1 {
            Ok(challenge_page())
        } else {
            Ok(RawResponse::new(200, listing_page(page, 2, false)))
        }
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].1, calls[1].1, "blocked identity was reused");
    assert_eq!(report.blocks_seen, 1);
    assert_eq!(report.sessions_retired, 1);
    assert_eq!(report.records_persisted, 2);
    assert!(matches!(report.outcome, CrawlOutcome::Done(_)));
}

#[tokio::test]
async fn test_zero_record_page_is_done() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::new(|page, _| {
        let count = if page < 3 { 2 } else { 0 };
        Ok(RawResponse::new(200, listing_page(page, count, true)))
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(
        report.outcome,
        CrawlOutcome::Done("page returned zero records".to_string())
    );
    assert_eq!(crawler.cursor().phase(), CursorPhase::Done);
    assert_eq!(report.pages_abandoned, 0);
    assert_eq!(report.records_persisted, 4);
}

#[tokio::test]
async fn test_max_pages_stops_after_exact_count() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::site(10, 2);

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, Some(3), &StopSignal::new()).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::MaxPagesReached);
    assert_eq!(report.pages_succeeded, 3);
    assert_eq!(report.last_completed_page, Some(3));
    assert_eq!(crawler.cursor().last_completed_page(), Some(3));
    assert_eq!(checkpoint_page(&config), 3);
    assert_eq!(transport.pages_requested(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_resume_continues_after_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");

    {
        let mut crawler = orchestrator(&config, ScriptedTransport::site(6, 2));
        crawler.run(None, Some(2), &StopSignal::new()).await.unwrap();
    }

    let transport = ScriptedTransport::site(6, 2);
    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.first_page_visited, Some(3));
    assert_eq!(transport.pages_requested(), vec![3, 4, 5, 6]);
    assert_eq!(report.records_duplicated, 0);

    let records = stored_records(&config);
    assert_eq!(records.len(), 12);
    assert_no_duplicate_ids(&records);
}

/// Persists page 5 the way a run would right before a crash
fn persist_page_behind_checkpoint(config: &Config, page: u32, with_ledger: bool) {
    let extractor = ListingExtractor::from_config(&config.target).unwrap();
    let extracted = extractor.extract(&listing_page(page, 2, true), page).unwrap();

    let mut store = CsvRecordStore::open(Path::new(&config.output.records_path)).unwrap();
    let report = store.persist_page(page, &extracted.records);
    assert!(report.receipt.is_some());

    if with_ledger {
        let mut ledger = SqliteLedger::new(Path::new(&config.output.ledger_path)).unwrap();
        let run_id = ledger.get_latest_run().unwrap().unwrap().id;
        let mut outcome = PageOutcomeRecord::completed(page, false);
        outcome.records_found = 2;
        outcome.records_persisted = 2;
        ledger.record_page(run_id, &outcome).unwrap();
    }
}

#[tokio::test]
async fn test_crash_before_checkpoint_resumes_at_next_page() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");

    {
        let mut crawler = orchestrator(&config, ScriptedTransport::site(10, 2));
        crawler.run(None, Some(4), &StopSignal::new()).await.unwrap();
    }
    persist_page_behind_checkpoint(&config, 5, true);
    assert_eq!(checkpoint_page(&config), 4);

    let transport = ScriptedTransport::site(10, 2);
    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.first_page_visited, Some(6));
    assert_eq!(transport.pages_requested(), vec![6, 7, 8, 9, 10]);

    let records = stored_records(&config);
    assert_eq!(records.len(), 20);
    assert_no_duplicate_ids(&records);
    let first_five = records.iter().filter(|r| r.page_number <= 5).count();
    assert_eq!(first_five, 10);
}

#[tokio::test]
async fn test_crash_after_last_record_resumes_at_next_page() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");

    {
        let mut crawler = orchestrator(&config, ScriptedTransport::site(10, 2));
        crawler.run(None, Some(4), &StopSignal::new()).await.unwrap();
    }
    // Neither the ledger row nor the checkpoint for page 5 was written
    persist_page_behind_checkpoint(&config, 5, false);
    assert_eq!(checkpoint_page(&config), 4);

    let transport = ScriptedTransport::site(10, 2);
    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.first_page_visited, Some(6));
    assert_eq!(transport.pages_requested(), vec![6, 7, 8, 9, 10]);
    assert_eq!(report.records_duplicated, 0);

    let records = stored_records(&config);
    assert_eq!(records.len(), 20);
    assert_no_duplicate_ids(&records);
    let first_five = records.iter().filter(|r| r.page_number <= 5).count();
    assert_eq!(first_five, 10);
}

#[tokio::test]
async fn test_crash_mid_page_refetches_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");

    {
        let mut crawler = orchestrator(&config, ScriptedTransport::site(6, 2));
        crawler.run(None, Some(4), &StopSignal::new()).await.unwrap();
    }
    {
        // Only the first of page 5's two records reached disk
        let extractor = ListingExtractor::from_config(&config.target).unwrap();
        let extracted = extractor.extract(&listing_page(5, 2, true), 5).unwrap();
        let mut store = CsvRecordStore::open(Path::new(&config.output.records_path)).unwrap();
        store.persist(&extracted.records[0]).unwrap();
        assert_eq!(store.highest_complete_page(), Some(4));
    }

    let transport = ScriptedTransport::site(6, 2);
    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.first_page_visited, Some(5));
    assert_eq!(report.records_duplicated, 1);
    assert_eq!(report.records_persisted, 3);

    let records = stored_records(&config);
    assert_eq!(records.len(), 12);
    assert_no_duplicate_ids(&records);
}

#[tokio::test]
async fn test_hard_block_abandons_page_and_continues() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::new(|page, _| {
        if page == 2 {
            Ok(RawResponse::new(403, "Forbidden"))
        } else {
            Ok(RawResponse::new(200, listing_page(page, 2, page < 3)))
        }
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert!(matches!(report.outcome, CrawlOutcome::Done(_)));
    assert_eq!(report.pages_abandoned, 1);
    assert_eq!(report.abandoned_pages, vec![2]);
    assert_eq!(report.pages_succeeded, 2);

    let page_two_calls = transport.calls().iter().filter(|(p, _)| *p == 2).count();
    assert_eq!(page_two_calls, config.retry.hard_block_attempts as usize);

    let saved = CheckpointStore::new(&config.output.checkpoint_path)
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.abandoned_pages, vec![2]);
}

#[tokio::test]
async fn test_untolerated_failure_fails_crawl() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(
        dir.path(),
        BASE_URL,
        "[crawl]\ntolerate-page-failures = false\n",
    );
    let transport = ScriptedTransport::new(|page, _| {
        if page == 2 {
            Ok(challenge_page())
        } else {
            Ok(RawResponse::new(200, listing_page(page, 2, true)))
        }
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert!(report.outcome.is_failure());
    assert_eq!(report.last_completed_page, Some(1));
    assert_eq!(crawler.cursor().phase(), CursorPhase::Failed);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let transport = ScriptedTransport::new(|page, call| {
        if call < 3 {
            Err(TransportError::Timeout("simulated".to_string()))
        } else {
            Ok(RawResponse::new(200, listing_page(page, 1, false)))
        }
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(transport.calls().len(), 3);
    assert_eq!(report.pages_succeeded, 1);
    assert_eq!(report.blocks_seen, 0);
}

#[tokio::test]
async fn test_stop_signal_is_honoured_between_pages() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let stop = StopSignal::new();
    let stop_on_page_two = stop.clone();
    let transport = ScriptedTransport::new(move |page, _| {
        if page == 2 {
            stop_on_page_two.stop();
        }
        Ok(RawResponse::new(200, listing_page(page, 2, true)))
    });

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &stop).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Cancelled);
    assert_eq!(report.last_completed_page, Some(2));
    assert_eq!(transport.pages_requested(), vec![1, 2]);
}

/// Record store that refuses to write records from one page
struct FailingStore {
    inner: CsvRecordStore,
    failing_page: u32,
}

impl DeduplicationStore for FailingStore {
    fn is_new(&self, unique_id: &str) -> bool {
        self.inner.is_new(unique_id)
    }

    fn persist(&mut self, record: &Record) -> StorageResult<PersistOutcome> {
        if record.page_number == self.failing_page {
            return Err(StorageError::Database("disk full".to_string()));
        }
        self.inner.persist(record)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn highest_complete_page(&self) -> Option<u32> {
        self.inner.highest_complete_page()
    }
}

#[tokio::test]
async fn test_storage_failure_never_advances_cursor() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "");
    let store = FailingStore {
        inner: CsvRecordStore::open(Path::new(&config.output.records_path)).unwrap(),
        failing_page: 2,
    };

    let mut crawler =
        orchestrator_with_store(&config, ScriptedTransport::site(5, 2), Box::new(store));
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert!(report.outcome.is_failure());
    assert_eq!(report.records_failed, 2);
    assert_eq!(report.last_completed_page, Some(1));
    assert_eq!(checkpoint_page(&config), 1);
    drop(crawler);

    // A later run with a healthy store picks up the failed page
    let transport = ScriptedTransport::site(5, 2);
    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();
    assert_eq!(report.first_page_visited, Some(2));
    assert_eq!(stored_records(&config).len(), 10);
}

#[tokio::test]
async fn test_page_cap_ends_crawl() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), BASE_URL, "[crawl]\npage-cap = 2\n");
    let transport = ScriptedTransport::site(10, 1);

    let mut crawler = orchestrator(&config, transport.clone());
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Done("page cap reached".to_string()));
    assert_eq!(transport.pages_requested(), vec![1, 2]);
}

/// Matches requests by the value of the `page` query parameter
struct PageParam(Option<&'static str>);

impl wiremock::Match for PageParam {
    fn matches(&self, request: &Request) -> bool {
        let page = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .map(|(_, value)| value.into_owned());
        page.as_deref() == self.0
    }
}

#[tokio::test]
async fn test_end_to_end_over_http() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let base_url = format!("{}/c/templates", mock_server.uri());
    let config = create_test_config(dir.path(), &base_url, "");

    let pages: HashMap<Option<&'static str>, u32> =
        [(None, 1), (Some("2"), 2), (Some("3"), 3)].into_iter().collect();
    for (param, page) in pages {
        let mut mock = Mock::given(method("GET"))
            .and(path("/c/templates"))
            .and(PageParam(param))
            .and(header_exists("user-agent"));
        if page > 1 {
            mock = mock.and(header_exists("referer"));
        }
        mock.respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(listing_page(page, 2, page < 3))
                    .insert_header("content-type", "text/html"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let transport = Arc::new(ReqwestTransport::new(config.transport.clone()));
    let mut crawler = orchestrator(&config, transport);
    let report = crawler.run(None, None, &StopSignal::new()).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Done("no next page".to_string()));
    assert_eq!(report.records_persisted, 6);

    let records = stored_records(&config);
    assert_eq!(records.len(), 6);
    assert!(records[0].url.ends_with("/listing/1001/item-1001"));

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let results: PathBuf = PathBuf::from(&config.output.results_path);
    listing_harvest::output::write_results(&report, &results).unwrap();
    assert!(results.exists());
}
