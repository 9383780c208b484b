//! Crawler module for paced, identity-rotating page fetching
//!
//! This module contains the core crawling logic, including:
//! - Randomised request spacing (`RateLimiter`)
//! - Failure classification and backoff (`RetryPolicy`, `BlockDetector`)
//! - Rotating browsing identities (`SessionPool`)
//! - The HTTP transport and listing extraction seams
//! - Overall crawl orchestration

mod detector;
mod extractor;
mod orchestrator;
mod rate_limiter;
mod retry;
mod session;
mod transport;

pub use detector::{BlockDetector, Classification};
pub use extractor::{ExtractedPage, ExtractionError, Extractor, ListingExtractor};
pub use orchestrator::{CrawlContext, CrawlOutcome, CrawlReport, Orchestrator, StopSignal};
pub use rate_limiter::RateLimiter;
pub use retry::{FailureKind, RetryDecision, RetryEpisode, RetryPolicy};
pub use session::{Fingerprint, Session, SessionOutcome, SessionPool};
pub use transport::{
    build_session_client, PageRequest, RawResponse, ReqwestTransport, Transport, TransportError,
};
