use serde::Deserialize;

/// Main configuration structure for Listing-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    pub output: OutputConfig,
}

/// The listing category being crawled
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    /// URL of the first page of the category
    pub base_url: String,

    /// Query parameter carrying the page number
    #[serde(default = "default_page_param")]
    pub page_param: String,

    /// Optional query parameter set to `pagination_<n>` on pages after the first
    #[serde(default)]
    pub ref_param: Option<String>,
}

/// Pagination and failure tolerance settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlConfig {
    /// Absolute last page to crawl; reaching it ends the crawl as done
    pub page_cap: Option<u32>,

    /// Whether an abandoned page lets the crawl continue with the next page
    pub tolerate_page_failures: bool,

    /// Consecutive abandoned pages after which the crawl fails
    pub max_consecutive_failures: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            page_cap: None,
            tolerate_page_failures: true,
            max_consecutive_failures: 3,
        }
    }
}

/// Inter-request spacing bounds (milliseconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 3_000,
            max_delay_ms: 8_000,
        }
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    /// Attempt cap for transient-network and rate-limited failures
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Exponential growth factor between retries
    pub backoff_factor: f64,

    /// Upper bound on a single backoff delay (milliseconds)
    pub max_delay_ms: u64,

    /// Upper bound on the summed retry delays of one request (milliseconds)
    pub max_total_wait_ms: u64,

    /// Fraction of the computed delay added as random jitter, in [0, 1)
    pub jitter: f64,

    /// Attempt cap when the response is a recoverable challenge
    pub soft_block_attempts: u32,

    /// Cooldown range applied after a soft block (milliseconds)
    pub soft_block_cooldown_min_ms: u64,
    pub soft_block_cooldown_max_ms: u64,

    /// Attempt cap for hard blocks
    pub hard_block_attempts: u32,

    /// Attempt cap for malformed responses and extraction failures
    pub malformed_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            max_total_wait_ms: 300_000,
            jitter: 0.25,
            soft_block_attempts: 3,
            soft_block_cooldown_min_ms: 30_000,
            soft_block_cooldown_max_ms: 60_000,
            hard_block_attempts: 2,
            malformed_attempts: 2,
        }
    }
}

/// Browsing session rotation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Number of live sessions rotated round-robin
    pub pool_size: u32,

    /// Requests served before a session is retired
    pub max_requests: u32,

    /// Session lifetime in seconds
    pub max_age_secs: u64,

    /// Replaces the built-in browser profile table when non-empty
    pub user_agents: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            max_requests: 50,
            max_age_secs: 300,
            user_agents: Vec::new(),
        }
    }
}

/// Response classification settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DetectionConfig {
    /// Statuses that indicate the identity was blocked
    pub block_statuses: Vec<u16>,

    /// Statuses that indicate throttling
    pub rate_limit_statuses: Vec<u16>,

    /// Body substrings of a recoverable challenge page (case-insensitive)
    pub challenge_markers: Vec<String>,

    /// Response header names that accompany a challenge
    pub challenge_headers: Vec<String>,

    /// Body substrings of a genuine listing page; any one suffices (case-insensitive)
    pub valid_page_markers: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            block_statuses: vec![403, 503],
            rate_limit_statuses: vec![429],
            challenge_markers: vec!["captcha".to_string(), "dd-protection".to_string()],
            challenge_headers: vec!["x-datadome".to_string()],
            valid_page_markers: vec![
                "data-listing-id".to_string(),
                "search-listings-group".to_string(),
                "wt-pagination".to_string(),
            ],
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransportConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub proxy_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            proxy_url: None,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the CSV record store
    #[serde(rename = "records-path")]
    pub records_path: String,

    /// Path to the pagination checkpoint file
    #[serde(rename = "checkpoint-path")]
    pub checkpoint_path: String,

    /// Path to the SQLite run ledger
    #[serde(rename = "ledger-path")]
    pub ledger_path: String,

    /// Path to the JSON run results file
    #[serde(rename = "results-path")]
    pub results_path: String,
}

fn default_page_param() -> String {
    "page".to_string()
}
