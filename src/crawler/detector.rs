//! Response classification
//!
//! Turns a raw response into a [`Classification`]. Retry handling only ever
//! sees the resulting [`FailureKind`], never the response itself.

use crate::config::DetectionConfig;
use crate::crawler::retry::FailureKind;
use crate::crawler::transport::RawResponse;

/// Verdict on a single response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A harvestable listing page
    Ok,
    /// Recoverable challenge page
    SoftBlock,
    /// Identity rejected outright
    HardBlock,
    /// Throttled without a challenge
    RateLimited,
    /// Not recognisable as a listing page
    Malformed,
}

impl Classification {
    /// Failure kind for non-`Ok` classifications
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Classification::Ok => None,
            Classification::SoftBlock => Some(FailureKind::SoftBlock),
            Classification::HardBlock => Some(FailureKind::HardBlock),
            Classification::RateLimited => Some(FailureKind::RateLimited),
            Classification::Malformed => Some(FailureKind::MalformedResponse),
        }
    }
}

/// Classifies responses using configured statuses and markers
#[derive(Debug, Clone)]
pub struct BlockDetector {
    block_statuses: Vec<u16>,
    rate_limit_statuses: Vec<u16>,
    challenge_markers: Vec<String>,
    challenge_headers: Vec<String>,
    valid_page_markers: Vec<String>,
}

impl BlockDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.to_ascii_lowercase()).collect()
        };

        Self {
            block_statuses: config.block_statuses.clone(),
            rate_limit_statuses: config.rate_limit_statuses.clone(),
            challenge_markers: lower(&config.challenge_markers),
            challenge_headers: lower(&config.challenge_headers),
            valid_page_markers: lower(&config.valid_page_markers),
        }
    }

    /// Classifies a response
    ///
    /// # Priority
    ///
    /// 1. Block or rate-limit status with a challenge present: `SoftBlock`
    /// 2. Rate-limit status: `RateLimited`
    /// 3. Block status: `HardBlock`
    /// 4. Challenge present and no valid-page marker: `SoftBlock`
    /// 5. No valid-page marker: `Malformed`
    /// 6. Otherwise `Ok`, whatever the status
    pub fn classify(&self, response: &RawResponse) -> Classification {
        let body = response.body.to_ascii_lowercase();
        let challenged = self.has_challenge(response, &body);
        let is_block_status = self.block_statuses.contains(&response.status);
        let is_rate_limit_status = self.rate_limit_statuses.contains(&response.status);

        if (is_block_status || is_rate_limit_status) && challenged {
            return Classification::SoftBlock;
        }
        if is_rate_limit_status {
            return Classification::RateLimited;
        }
        if is_block_status {
            return Classification::HardBlock;
        }

        let looks_valid = self.looks_valid(&body);
        if challenged && !looks_valid {
            return Classification::SoftBlock;
        }
        if !looks_valid {
            return Classification::Malformed;
        }

        Classification::Ok
    }

    fn has_challenge(&self, response: &RawResponse, lowercase_body: &str) -> bool {
        self.challenge_headers
            .iter()
            .any(|name| response.headers.contains_key(name))
            || self
                .challenge_markers
                .iter()
                .any(|marker| lowercase_body.contains(marker))
    }

    /// An empty marker list accepts every body
    fn looks_valid(&self, lowercase_body: &str) -> bool {
        self.valid_page_markers.is_empty()
            || self
                .valid_page_markers
                .iter()
                .any(|marker| lowercase_body.contains(marker))
    }
}
