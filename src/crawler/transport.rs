//! HTTP transport
//!
//! The [`Transport`] trait is the seam between the orchestrator and the
//! network. [`ReqwestTransport`] is the production implementation: one
//! `reqwest::Client` per live session, carrying that session's cookie jar and
//! browser fingerprint headers.

use crate::config::TransportConfig;
use crate::crawler::session::{Fingerprint, Session};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Transport-level failure; always classified as transient-network
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// One outbound page request
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,

    /// URL of the previously fetched page, sent as `Referer`
    pub referer: Option<String>,

    pub proxy: Option<String>,
}

/// Raw response handed to the block detector
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,

    /// Header names are lowercase
    pub headers: HashMap<String, String>,

    pub body: String,
}

impl RawResponse {
    /// Builds a response with no headers
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Sends page requests on behalf of a session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches a page using the identity of `session`
    async fn send(&self, session: &Session, request: &PageRequest)
        -> Result<RawResponse, TransportError>;

    /// Drops any per-session state once the pool retires a session
    async fn forget_session(&self, _session_id: u64) {}
}

/// `reqwest`-backed transport with per-session clients
pub struct ReqwestTransport {
    config: TransportConfig,
    clients: Mutex<HashMap<u64, Client>>,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions that currently have a client
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn client_for(
        &self,
        session: &Session,
        proxy: Option<&str>,
    ) -> Result<Client, TransportError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&session.id) {
            return Ok(client.clone());
        }

        let proxy = proxy.or(self.config.proxy_url.as_deref());
        let client = build_session_client(&self.config, session, proxy)?;
        debug!(session_id = session.id, "Built HTTP client for session");
        clients.insert(session.id, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        session: &Session,
        request: &PageRequest,
    ) -> Result<RawResponse, TransportError> {
        let client = self.client_for(session, request.proxy.as_deref()).await?;

        let mut builder = client.get(&request.url);
        if let Some(referer) = &request.referer {
            builder = builder.header(reqwest::header::REFERER, referer);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    async fn forget_session(&self, session_id: u64) {
        self.clients.lock().await.remove(&session_id);
    }
}

/// Builds an HTTP client presenting a session's fingerprint and cookies
///
/// # Arguments
///
/// * `config` - Timeouts and default proxy
/// * `session` - Identity whose cookie jar and fingerprint the client carries
/// * `proxy` - Proxy URL overriding the configured one
pub fn build_session_client(
    config: &TransportConfig,
    session: &Session,
    proxy: Option<&str>,
) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .user_agent(session.fingerprint.user_agent.clone())
        .default_headers(fingerprint_headers(&session.fingerprint))
        .cookie_provider(session.cookie_jar.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy)
            .map_err(|e| TransportError::Other(format!("invalid proxy '{}': {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(TransportError::from)
}

/// Browser-like default headers for a fingerprint
fn fingerprint_headers(fingerprint: &Fingerprint) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let mut insert = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };

    insert(
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    );
    insert("accept-language", &fingerprint.accept_language);
    insert("upgrade-insecure-requests", "1");
    insert("sec-fetch-dest", "document");
    insert("sec-fetch-mode", "navigate");
    insert("sec-fetch-site", "same-origin");
    if let Some(ch) = &fingerprint.sec_ch_ua {
        insert("sec-ch-ua", ch);
        insert("sec-ch-ua-mobile", "?0");
    }
    if let Some(platform) = &fingerprint.sec_ch_ua_platform {
        insert("sec-ch-ua-platform", platform);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_response_headers_case_insensitive() {
        let response = RawResponse::new(200, "ok").with_header("X-DataDome", "protected");
        assert_eq!(response.header("x-datadome"), Some("protected"));
        assert_eq!(response.header("X-DATADOME"), Some("protected"));
        assert_eq!(response.header("server"), None);
    }

    #[test]
    fn test_fingerprint_headers() {
        let fingerprint = Fingerprint {
            user_agent: "Test/1.0".to_string(),
            sec_ch_ua: Some("\"Chromium\";v=\"124\"".to_string()),
            sec_ch_ua_platform: Some("\"Linux\"".to_string()),
            accept_language: "en-US,en;q=0.9".to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
        };
        let headers = fingerprint_headers(&fingerprint);

        assert_eq!(headers.get("accept-language").unwrap(), "en-US,en;q=0.9");
        assert_eq!(headers.get("sec-ch-ua-platform").unwrap(), "\"Linux\"");
        assert_eq!(headers.get("sec-ch-ua-mobile").unwrap(), "?0");
    }

    #[test]
    fn test_fingerprint_headers_without_client_hints() {
        let fingerprint = Fingerprint {
            user_agent: "Firefox".to_string(),
            sec_ch_ua: None,
            sec_ch_ua_platform: None,
            accept_language: "en-GB".to_string(),
            viewport_width: 1366,
            viewport_height: 768,
        };
        let headers = fingerprint_headers(&fingerprint);
        assert!(headers.get("sec-ch-ua").is_none());
        assert!(headers.get("accept").is_some());
    }
}
