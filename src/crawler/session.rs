//! Rotating pool of browsing identities
//!
//! A [`Session`] is a logical identity: a browser fingerprint plus its own
//! cookie jar. The pool hands sessions out by value, so a session that is
//! in flight cannot be handed out a second time until it is released.

use crate::config::SessionConfig;
use crate::crawler::retry::FailureKind;
use crate::HarvestError;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::cookie::Jar;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Desktop browser profiles: user agent, `sec-ch-ua`, `sec-ch-ua-platform`
const BROWSER_PROFILES: &[(&str, Option<&str>, Option<&str>)] = &[
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        Some("\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
        Some("\"Windows\""),
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        Some("\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
        Some("\"macOS\""),
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
        Some("\"Microsoft Edge\";v=\"123\", \"Not:A-Brand\";v=\"8\", \"Chromium\";v=\"123\""),
        Some("\"Windows\""),
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        None,
        None,
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
        None,
        None,
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        Some("\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
        Some("\"Linux\""),
    ),
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,en;q=0.8",
    "en-CA,en;q=0.9,fr-CA;q=0.7",
];

const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1366, 768), (1536, 864), (1440, 900), (2560, 1440)];

/// Browser identity presented by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub sec_ch_ua: Option<String>,
    pub sec_ch_ua_platform: Option<String>,
    pub accept_language: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Fingerprint {
    /// Generates a randomised fingerprint
    ///
    /// # Arguments
    ///
    /// * `user_agents` - Replaces the built-in profile table when non-empty
    /// * `avoid` - A fingerprint whose user agent should not be reused if
    ///   another one is available
    pub fn randomized(user_agents: &[String], avoid: Option<&Fingerprint>) -> Self {
        let mut rng = rand::thread_rng();

        let profiles: Vec<(String, Option<String>, Option<String>)> = if user_agents.is_empty() {
            BROWSER_PROFILES
                .iter()
                .map(|(ua, ch, platform)| {
                    (
                        ua.to_string(),
                        ch.map(str::to_string),
                        platform.map(str::to_string),
                    )
                })
                .collect()
        } else {
            user_agents
                .iter()
                .map(|ua| (ua.clone(), None, None))
                .collect()
        };

        let candidates: Vec<&(String, Option<String>, Option<String>)> = match avoid {
            Some(previous) if profiles.len() > 1 => profiles
                .iter()
                .filter(|(ua, _, _)| ua != &previous.user_agent)
                .collect(),
            _ => profiles.iter().collect(),
        };

        // Non-empty: both the built-in table and a validated override have entries
        let (user_agent, sec_ch_ua, sec_ch_ua_platform) = candidates
            .choose(&mut rng)
            .map(|p| (*p).clone())
            .unwrap_or_else(|| (BROWSER_PROFILES[0].0.to_string(), None, None));

        let (viewport_width, viewport_height) = VIEWPORTS[rng.gen_range(0..VIEWPORTS.len())];

        Self {
            user_agent,
            sec_ch_ua,
            sec_ch_ua_platform,
            accept_language: ACCEPT_LANGUAGES[rng.gen_range(0..ACCEPT_LANGUAGES.len())]
                .to_string(),
            viewport_width,
            viewport_height,
        }
    }
}

/// A logical browsing identity
#[derive(Debug, Clone)]
pub struct Session {
    /// Monotonically increasing identifier, never reused within a process
    pub id: u64,

    pub fingerprint: Fingerprint,

    /// Cookie state accumulated by this identity
    pub cookie_jar: Arc<Jar>,

    pub created_at: Instant,

    /// Requests served so far
    pub request_count: u32,

    pub last_used_at: Option<Instant>,
}

impl Session {
    fn new(id: u64, fingerprint: Fingerprint, now: Instant) -> Self {
        Self {
            id,
            fingerprint,
            cookie_jar: Arc::new(Jar::default()),
            created_at: now,
            request_count: 0,
            last_used_at: None,
        }
    }

    /// Age of the session at `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// How the request served by a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Failed,
    SoftBlocked,
    HardBlocked,
}

impl SessionOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, SessionOutcome::SoftBlocked | SessionOutcome::HardBlocked)
    }
}

impl From<FailureKind> for SessionOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::SoftBlock => SessionOutcome::SoftBlocked,
            FailureKind::HardBlock => SessionOutcome::HardBlocked,
            _ => SessionOutcome::Failed,
        }
    }
}

#[derive(Debug)]
enum Slot {
    /// No session yet, or the previous one was retired
    Empty,
    Idle(Session),
    InFlight(u64),
}

/// Round-robin pool of live sessions
#[derive(Debug)]
pub struct SessionPool {
    config: SessionConfig,
    slots: Vec<Slot>,

    /// Slot the next acquisition starts searching from
    cursor: usize,

    next_id: u64,

    /// Fingerprint of the most recently retired session
    last_retired: Option<Fingerprint>,

    created: u64,
    retired: u64,
}

impl SessionPool {
    /// Creates an empty pool; sessions are created lazily
    pub fn new(config: SessionConfig) -> Self {
        let size = config.pool_size.max(1) as usize;
        let slots = (0..size).map(|_| Slot::Empty).collect();

        Self {
            config,
            slots,
            cursor: 0,
            next_id: 1,
            last_retired: None,
            created: 0,
            retired: 0,
        }
    }

    /// Acquires a session for exclusive use by one request
    pub fn acquire(&mut self) -> Result<Session, HarvestError> {
        self.acquire_at(Instant::now())
    }

    /// Acquires a session, treating `now` as the current time
    ///
    /// Slots are visited round-robin starting after the previously used one.
    /// An idle session past its age limit is retired and replaced in place.
    ///
    /// # Returns
    ///
    /// * `Ok(Session)` - An idle or freshly created session
    /// * `Err(HarvestError::Session)` - Every slot is in flight
    pub fn acquire_at(&mut self, now: Instant) -> Result<Session, HarvestError> {
        let len = self.slots.len();

        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if matches!(self.slots[index], Slot::InFlight(_)) {
                continue;
            }

            let previous = std::mem::replace(&mut self.slots[index], Slot::Empty);
            let session = match previous {
                Slot::Idle(session) if !self.is_expired(&session, now) => session,
                Slot::Idle(session) => {
                    debug!(session_id = session.id, "Session aged out before reuse");
                    self.retire(session);
                    self.create_session(now)
                }
                _ => self.create_session(now),
            };

            self.slots[index] = Slot::InFlight(session.id);
            self.cursor = (index + 1) % len;
            return Ok(session);
        }

        Err(HarvestError::Session(format!(
            "all {} sessions are in flight",
            len
        )))
    }

    /// Returns a session after its request completed
    ///
    /// # Returns
    ///
    /// `true` when the session was retired (blocked, too many requests, too
    /// old); its slot is refilled on a later acquisition.
    pub fn release(&mut self, session: Session, outcome: SessionOutcome) -> bool {
        self.release_at(session, outcome, Instant::now())
    }

    /// Returns a session, treating `now` as the current time
    pub fn release_at(&mut self, mut session: Session, outcome: SessionOutcome, now: Instant) -> bool {
        session.request_count += 1;
        session.last_used_at = Some(now);

        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::InFlight(id) if *id == session.id));

        let Some(index) = index else {
            debug!(session_id = session.id, "Released session not owned by pool");
            self.retire(session);
            return true;
        };

        let reason = if outcome.is_blocked() {
            Some("blocked")
        } else if session.request_count >= self.config.max_requests {
            Some("request limit")
        } else if self.is_expired(&session, now) {
            Some("age limit")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                info!(
                    session_id = session.id,
                    requests = session.request_count,
                    "Retiring session ({})",
                    reason
                );
                self.slots[index] = Slot::Empty;
                self.retire(session);
                true
            }
            None => {
                self.slots[index] = Slot::Idle(session);
                false
            }
        }
    }

    /// Number of sessions created since the pool was built
    pub fn sessions_created(&self) -> u64 {
        self.created
    }

    /// Number of sessions retired since the pool was built
    pub fn sessions_retired(&self) -> u64 {
        self.retired
    }

    /// Number of slots currently holding a live (idle or in-flight) session
    pub fn live_sessions(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Empty))
            .count()
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        session.age(now) >= Duration::from_secs(self.config.max_age_secs)
    }

    fn create_session(&mut self, now: Instant) -> Session {
        let id = self.next_id;
        self.next_id += 1;
        self.created += 1;

        let fingerprint =
            Fingerprint::randomized(&self.config.user_agents, self.last_retired.as_ref());
        debug!(session_id = id, user_agent = %fingerprint.user_agent, "Created session");

        Session::new(id, fingerprint, now)
    }

    fn retire(&mut self, session: Session) {
        self.retired += 1;
        self.last_retired = Some(session.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> SessionConfig {
        SessionConfig {
            pool_size: 2,
            max_requests: 3,
            max_age_secs: 60,
            user_agents: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_avoids_previous_user_agent() {
        let agents = vec!["AgentA/1.0".to_string(), "AgentB/1.0".to_string()];
        let previous = Fingerprint::randomized(&agents, None);

        for _ in 0..20 {
            let next = Fingerprint::randomized(&agents, Some(&previous));
            assert_ne!(next.user_agent, previous.user_agent);
        }
    }

    #[test]
    fn test_fingerprint_single_agent_is_reused() {
        let agents = vec!["OnlyAgent/1.0".to_string()];
        let previous = Fingerprint::randomized(&agents, None);
        let next = Fingerprint::randomized(&agents, Some(&previous));
        assert_eq!(next.user_agent, "OnlyAgent/1.0");
    }

    #[test]
    fn test_sessions_created_lazily_round_robin() {
        let mut pool = SessionPool::new(create_test_config());
        let now = Instant::now();
        assert_eq!(pool.live_sessions(), 0);

        let first = pool.acquire_at(now).unwrap();
        assert!(!pool.release_at(first, SessionOutcome::Success, now));

        let second = pool.acquire_at(now).unwrap();
        assert_eq!(second.id, 2);
        assert!(!pool.release_at(second, SessionOutcome::Success, now));

        // Wraps back to the first slot
        let third = pool.acquire_at(now).unwrap();
        assert_eq!(third.id, 1);
        assert_eq!(third.request_count, 1);
        assert_eq!(pool.sessions_created(), 2);
    }

    #[test]
    fn test_in_flight_session_is_never_shared() {
        let mut pool = SessionPool::new(create_test_config());
        let now = Instant::now();

        let a = pool.acquire_at(now).unwrap();
        let b = pool.acquire_at(now).unwrap();
        assert_ne!(a.id, b.id);

        assert!(matches!(pool.acquire_at(now), Err(HarvestError::Session(_))));

        pool.release_at(a, SessionOutcome::Success, now);
        let c = pool.acquire_at(now).unwrap();
        assert_ne!(c.id, b.id);
    }

    #[test]
    fn test_blocked_session_is_retired_and_replaced() {
        let config = SessionConfig {
            pool_size: 1,
            ..create_test_config()
        };
        let mut pool = SessionPool::new(config);
        let now = Instant::now();

        let session = pool.acquire_at(now).unwrap();
        let blocked_id = session.id;
        assert!(pool.release_at(session, SessionOutcome::SoftBlocked, now));
        assert_eq!(pool.live_sessions(), 0);

        let replacement = pool.acquire_at(now).unwrap();
        assert_ne!(replacement.id, blocked_id);
        assert_eq!(pool.sessions_retired(), 1);
    }

    #[test]
    fn test_session_retired_after_request_limit() {
        let config = SessionConfig {
            pool_size: 1,
            ..create_test_config()
        };
        let mut pool = SessionPool::new(config);
        let now = Instant::now();

        for _ in 0..2 {
            let session = pool.acquire_at(now).unwrap();
            assert_eq!(session.id, 1);
            assert!(!pool.release_at(session, SessionOutcome::Success, now));
        }

        let session = pool.acquire_at(now).unwrap();
        assert!(pool.release_at(session, SessionOutcome::Failed, now));

        assert_eq!(pool.acquire_at(now).unwrap().id, 2);
    }

    #[test]
    fn test_idle_session_expires_by_age() {
        let config = SessionConfig {
            pool_size: 1,
            max_age_secs: 10,
            ..create_test_config()
        };
        let mut pool = SessionPool::new(config);
        let start = Instant::now();

        let session = pool.acquire_at(start).unwrap();
        pool.release_at(session, SessionOutcome::Success, start);

        let later = start + Duration::from_secs(11);
        let session = pool.acquire_at(later).unwrap();
        assert_eq!(session.id, 2);
        assert_eq!(pool.sessions_retired(), 1);
    }

    #[test]
    fn test_outcome_from_failure_kind() {
        assert_eq!(
            SessionOutcome::from(FailureKind::SoftBlock),
            SessionOutcome::SoftBlocked
        );
        assert_eq!(
            SessionOutcome::from(FailureKind::HardBlock),
            SessionOutcome::HardBlocked
        );
        assert_eq!(
            SessionOutcome::from(FailureKind::TransientNetwork),
            SessionOutcome::Failed
        );
    }
}
