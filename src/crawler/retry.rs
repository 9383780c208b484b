//! Failure classification and backoff scheduling
//!
//! The policy never sees raw responses. It consumes a [`FailureKind`] produced
//! by the block detector (or by the orchestrator for transport, extraction and
//! storage faults) and answers retry-or-abandon for the current page.

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Why a single attempt at a page failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeout, connection reset, DNS failure
    TransientNetwork,

    /// Throttling status without a challenge page
    RateLimited,

    /// Recoverable anti-automation challenge
    SoftBlock,

    /// The identity is unusable for this crawl
    HardBlock,

    /// The page lacks the structure of a genuine listing page
    MalformedResponse,

    /// A record of the page could not be written
    StorageWriteFailure,

    /// The extractor could not parse the page
    ExtractionFailure,
}

impl FailureKind {
    /// Converts the kind to its ledger string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::SoftBlock => "soft_block",
            FailureKind::HardBlock => "hard_block",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::StorageWriteFailure => "storage_write_failure",
            FailureKind::ExtractionFailure => "extraction_failure",
        }
    }

    /// Parses a ledger string back into a kind
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "transient_network" => Some(FailureKind::TransientNetwork),
            "rate_limited" => Some(FailureKind::RateLimited),
            "soft_block" => Some(FailureKind::SoftBlock),
            "hard_block" => Some(FailureKind::HardBlock),
            "malformed_response" => Some(FailureKind::MalformedResponse),
            "storage_write_failure" => Some(FailureKind::StorageWriteFailure),
            "extraction_failure" => Some(FailureKind::ExtractionFailure),
            _ => None,
        }
    }

    /// Whether the failure implicates the session identity
    pub fn is_block(&self) -> bool {
        matches!(self, FailureKind::SoftBlock | FailureKind::HardBlock)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry bookkeeping for one logical page request
///
/// Created fresh for each page and dropped on success or abandonment.
#[derive(Debug, Clone, Default)]
pub struct RetryEpisode {
    /// Failed attempts so far
    pub attempt_number: u32,

    /// Kind of the most recent failure
    pub last_error_kind: Option<FailureKind>,

    /// Delay scheduled before the next attempt
    pub next_delay: Duration,

    /// Sum of all delays scheduled in this episode
    pub total_wait: Duration,
}

impl RetryEpisode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts made, counting the first one
    pub fn attempts(&self) -> u32 {
        self.attempt_number
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry {
        delay: Duration,
        /// A fresh identity must serve the next attempt
        rotate_session: bool,
    },

    /// Give up on the page
    Abandon { kind: FailureKind, reason: String },
}

/// Decides whether and when a failed page request is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Maximum attempts (including the first) allowed for a failure kind
    pub fn attempt_cap(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::TransientNetwork | FailureKind::RateLimited => self.config.max_attempts,
            FailureKind::SoftBlock => self.config.soft_block_attempts,
            FailureKind::HardBlock => self.config.hard_block_attempts,
            FailureKind::MalformedResponse | FailureKind::ExtractionFailure => {
                self.config.malformed_attempts
            }
            FailureKind::StorageWriteFailure => 1,
        }
    }

    /// Records a failed attempt in `episode` and decides what happens next
    ///
    /// Delays within one episode never decrease. Abandonment happens when the
    /// attempt cap for `kind` is reached or when the next delay would exceed
    /// the episode's total wait budget.
    pub fn decide(&self, episode: &mut RetryEpisode, kind: FailureKind) -> RetryDecision {
        episode.attempt_number += 1;
        episode.last_error_kind = Some(kind);

        let cap = self.attempt_cap(kind);
        if episode.attempt_number >= cap {
            return RetryDecision::Abandon {
                kind,
                reason: format!(
                    "{} after {} attempt{}",
                    kind,
                    episode.attempt_number,
                    if episode.attempt_number == 1 { "" } else { "s" }
                ),
            };
        }

        let computed = self.raw_delay(episode.attempt_number, kind);
        let delay = computed.max(episode.next_delay);

        let budget = Duration::from_millis(self.config.max_total_wait_ms);
        if episode.total_wait + delay > budget {
            return RetryDecision::Abandon {
                kind,
                reason: format!(
                    "{}: retry wait budget of {}ms exhausted",
                    kind, self.config.max_total_wait_ms
                ),
            };
        }

        episode.next_delay = delay;
        episode.total_wait += delay;

        RetryDecision::Retry {
            delay,
            rotate_session: kind.is_block(),
        }
    }

    /// Delay for the `n`th failure (1-based) before monotonic adjustment
    fn raw_delay(&self, n: u32, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::SoftBlock => {
                let min = self.config.soft_block_cooldown_min_ms;
                let max = self.config.soft_block_cooldown_max_ms;
                let cooldown = if min >= max {
                    min
                } else {
                    rand::thread_rng().gen_range(min..=max)
                };
                Duration::from_millis(cooldown).max(self.backoff(n))
            }
            _ => self.backoff(n),
        }
    }

    /// Exponential backoff with proportional jitter, capped at `max_delay_ms`
    fn backoff(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(63) as i32;
        let base = self.config.base_delay_ms as f64 * self.config.backoff_factor.powi(exponent);
        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.jitter)
        } else {
            0.0
        };
        let millis = (base * (1.0 + jitter)).min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
