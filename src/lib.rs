//! Listing-Harvest: a resumable crawler for paginated listing sites
//!
//! This crate walks a paginated listing category one page at a time, behind a
//! hostile anti-automation layer, and persists every extracted record exactly
//! once. It paces requests with randomised delays, rotates browsing sessions,
//! classifies blocked responses, and checkpoints pagination progress so a
//! crash or restart never loses work or duplicates records.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Listing-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] crawler::TransportError),

    #[error("Extractor error: {0}")]
    Extraction(#[from] crawler::ExtractionError),

    #[error("Pagination cursor error: {0}")]
    Cursor(#[from] state::CursorError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session pool error: {0}")]
    Session(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),
}

/// Result type alias for Listing-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlOutcome, CrawlReport, Orchestrator, StopSignal};
pub use state::{CursorPhase, PaginationCursor};
pub use storage::{DeduplicationStore, Record};
