//! Randomised inter-request spacing
//!
//! Every outbound request, retries included, first waits on the limiter. The
//! gap between two request starts is drawn uniformly from `[min_delay,
//! max_delay]` so the cadence cannot be fingerprinted by a fixed period.

use crate::config::RateLimitConfig;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Process-wide request pacing state, owned by the crawl context
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Start time of the previous request
    last_request_at: Option<Instant>,

    /// Lower bound of the randomised gap
    min_delay: Duration,

    /// Upper bound of the randomised gap
    max_delay: Duration,
}

impl RateLimiter {
    /// Creates a limiter with explicit bounds
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };

        Self {
            last_request_at: None,
            min_delay,
            max_delay,
        }
    }

    /// Creates a limiter from the `[rate-limit]` configuration section
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    /// Draws a gap uniformly from `[min_delay, max_delay]`
    pub fn pick_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if min == max {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Time still to wait before a request may start, given a chosen gap
    ///
    /// # Returns
    ///
    /// * `None` - A request may start now
    /// * `Some(duration)` - Remaining wait
    pub fn time_until_slot(&self, gap: Duration, now: Instant) -> Option<Duration> {
        let last = self.last_request_at?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < gap {
            Some(gap - elapsed)
        } else {
            None
        }
    }

    /// Records that a request started at `now`
    pub fn record_request(&mut self, now: Instant) {
        self.last_request_at = Some(now);
    }

    /// Waits until the randomised gap since the previous request has elapsed
    ///
    /// Never returns early. The first request of a process is not delayed.
    /// The request start is recorded before returning.
    ///
    /// # Returns
    ///
    /// The time actually spent sleeping
    pub async fn wait_for_slot(&mut self) -> Duration {
        let gap = self.pick_delay();
        let mut slept = Duration::ZERO;

        // Loop guards against a timer firing marginally before the deadline.
        while let Some(remaining) = self.time_until_slot(gap, Instant::now()) {
            debug!(
                "Rate limiter sleeping {}ms (gap {}ms)",
                remaining.as_millis(),
                gap.as_millis()
            );
            tokio::time::sleep(remaining).await;
            slept += remaining;
        }

        self.record_request(Instant::now());
        slept
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
