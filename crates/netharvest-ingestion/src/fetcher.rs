//! HTTP fetching with retries.
//!
//! Every upstream call goes through [`Fetcher::fetch`]:
//!   - 2xx          → body returned immediately
//!   - 429          → wait `retry_delay × rate_limit_multiplier`, retry
//!   - other status → warn with a body excerpt, retry after the backoff delay
//!   - timeout / connection error → retry after the backoff delay
//!
//! Rate-limited attempts count against the attempt budget, and there is no
//! wait after the final attempt. The network and the clock are both injected
//! ([`HttpTransport`], [`Sleeper`]) so retry behaviour is testable without
//! real delays.

use async_trait::async_trait;
use netharvest_common::{FetchError, TransformError};
use netharvest_config::{BackoffKind, HttpConfig};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

const EXCERPT_LEN: usize = 200;

// ── Requests and responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One upstream call: URL, query (GET) or JSON body (POST) parameters, headers.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into(), method: Method::Get, params: Vec::new(), headers: Vec::new() }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self { method: Method::Post, ..Self::get(url) }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// What a transport hands back for one attempt, whatever the status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into(), elapsed: Duration::ZERO }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

/// A successful (2xx) response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    status: u16,
    bytes: Vec<u8>,
    elapsed: Duration,
    attempts: u32,
}

impl Body {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Wall time of the successful attempt.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Attempts used, including the successful one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransformError> {
        serde_json::from_slice(&self.bytes)
            .map_err(|e| TransformError::Malformed(format!("response is not valid JSON: {e}")))
    }
}

// ── Injected seams ────────────────────────────────────────────────────────────

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: &FetchRequest) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// reqwest-backed transport with a client-wide timeout and User-Agent.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::InvalidRequest {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url).query(&req.params),
            Method::Post => {
                let body: serde_json::Map<String, Value> = req
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                self.client.post(&req.url).json(&body)
            }
        };
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let t0 = Instant::now();
        let resp = builder.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(classify)?;

        Ok(TransportResponse { status, body: body.to_vec(), elapsed: t0.elapsed() })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every wait is the base delay.
    #[default]
    Fixed,
    /// `base × 2^(attempt-1)`, capped at `max_delay`.
    Exponential,
}

impl From<BackoffKind> for Backoff {
    fn from(kind: BackoffKind) -> Self {
        match kind {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential,
        }
    }
}

/// Why a single attempt did not produce a body.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    RateLimited,
    Status { status: u16, excerpt: String },
    Timeout(String),
    Transport(String),
}

impl AttemptFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::RateLimited => Some(429),
            AttemptFailure::Status { status, .. } => Some(*status),
            AttemptFailure::Timeout(_) | AttemptFailure::Transport(_) => None,
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::RateLimited => write!(f, "rate limited (HTTP 429)"),
            AttemptFailure::Status { status, excerpt } => write!(f, "HTTP {status}: {excerpt}"),
            AttemptFailure::Timeout(msg) => write!(f, "timeout: {msg}"),
            AttemptFailure::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
    pub rate_limit_multiplier: u32,
}

impl RetryPolicy {
    /// Fixed backoff, no extra wait on 429.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Fixed,
            max_delay: Duration::from_secs(60),
            rate_limit_multiplier: 1,
        }
    }

    pub fn from_config(http: &HttpConfig) -> Self {
        Self {
            max_attempts: http.retry_attempts,
            base_delay: http.retry_delay(),
            backoff: http.backoff.into(),
            max_delay: http.max_delay(),
            rate_limit_multiplier: http.rate_limit_multiplier,
        }
    }

    pub fn with_rate_limit_multiplier(mut self, multiplier: u32) -> Self {
        self.rate_limit_multiplier = multiplier;
        self
    }

    /// Wait before the attempt following `attempt` (1-based). Never exceeds
    /// `max_delay`, including the rate-limit multiplier.
    pub fn delay_after(&self, attempt: u32, failure: &AttemptFailure) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        let delay = match failure {
            AttemptFailure::RateLimited => delay.saturating_mul(self.rate_limit_multiplier.max(1)),
            _ => delay,
        };
        delay.min(self.max_delay)
    }
}

// ── Fetcher ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, sleeper: Arc<dyn Sleeper>, policy: RetryPolicy) -> Self {
        Self { transport, sleeper, policy }
    }

    /// reqwest transport and real sleeps, configured from `[http]`.
    pub fn from_config(http: &HttpConfig) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(http.timeout(), &http.user_agent)?;
        Ok(Self::new(Arc::new(transport), Arc::new(TokioSleeper), RetryPolicy::from_config(http)))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pacing delay between items or pages, on the same clock as the retries.
    pub async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.sleeper.sleep(duration).await;
        }
    }

    pub async fn fetch(&self, req: &FetchRequest) -> Result<Body, FetchError> {
        if req.url.trim().is_empty() {
            return Err(FetchError::InvalidRequest {
                url: req.url.clone(),
                reason: "empty URL".to_string(),
            });
        }

        let attempts = self.policy.max_attempts.max(1);
        let mut last = AttemptFailure::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            debug!(url = %req.url, attempt, "Sending request");

            let failure = match self.transport.send(req).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    return Ok(Body {
                        status: resp.status,
                        bytes: resp.body,
                        elapsed: resp.elapsed,
                        attempts: attempt,
                    });
                }
                Ok(resp) if resp.status == 429 => {
                    warn!(url = %req.url, attempt, max_attempts = attempts, "Rate limited");
                    AttemptFailure::RateLimited
                }
                Ok(resp) => {
                    let excerpt = excerpt(&resp.body);
                    warn!(url = %req.url, attempt, status = resp.status, body = %excerpt, "Request failed");
                    AttemptFailure::Status { status: resp.status, excerpt }
                }
                Err(TransportError::Timeout(msg)) => {
                    warn!(url = %req.url, attempt, max_attempts = attempts, "Request timeout");
                    AttemptFailure::Timeout(msg)
                }
                Err(e) => {
                    error!(url = %req.url, attempt, error = %e, "Request error");
                    AttemptFailure::Transport(e.to_string())
                }
            };

            if attempt < attempts {
                let delay = self.policy.delay_after(attempt, &failure);
                debug!(url = %req.url, attempt, delay_ms = delay.as_millis() as u64, "Retrying");
                self.sleeper.sleep(delay).await;
            }
            last = failure;
        }

        error!(url = %req.url, attempts, reason = %last, "All attempts failed");
        Err(FetchError::Exhausted {
            url: req.url.clone(),
            attempts,
            last_status: last.status(),
            reason: last.to_string(),
        })
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSleeper, ScriptedTransport};

    fn fetcher(transport: ScriptedTransport, policy: RetryPolicy) -> (Fetcher, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        (Fetcher::new(Arc::new(transport), sleeper.clone(), policy), sleeper)
    }

    #[tokio::test]
    async fn rate_limited_twice_then_ok_within_budget() {
        let transport = ScriptedTransport::sequence(vec![
            Ok(TransportResponse::new(429, "slow down")),
            Ok(TransportResponse::new(429, "slow down")),
            Ok(TransportResponse::new(200, "ok")),
        ]);
        let policy = RetryPolicy::new(3, Duration::from_secs(2)).with_rate_limit_multiplier(2);
        let (f, sleeper) = fetcher(transport, policy);

        let body = f.fetch(&FetchRequest::get("https://up.test/")).await.unwrap();
        assert_eq!(body.text(), "ok");
        assert_eq!(body.attempts(), 3);
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(4), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn rate_limited_twice_exhausts_two_attempts() {
        let transport = ScriptedTransport::sequence(vec![
            Ok(TransportResponse::new(429, "")),
            Ok(TransportResponse::new(429, "")),
            Ok(TransportResponse::new(200, "ok")),
        ]);
        let (f, sleeper) = fetcher(transport, RetryPolicy::new(2, Duration::from_secs(1)));

        let err = f.fetch(&FetchRequest::get("https://up.test/")).await.unwrap_err();
        match err {
            FetchError::Exhausted { attempts, last_status, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_status, Some(429));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Only the wait between attempt 1 and 2.
        assert_eq!(sleeper.recorded().len(), 1);
    }

    #[tokio::test]
    async fn timeouts_and_server_errors_are_retried() {
        let transport = ScriptedTransport::sequence(vec![
            Err(TransportError::Timeout("10s elapsed".into())),
            Ok(TransportResponse::new(503, "unavailable")),
            Ok(TransportResponse::new(204, "")),
        ]);
        let (f, _) = fetcher(transport, RetryPolicy::new(3, Duration::from_millis(10)));
        let body = f.fetch(&FetchRequest::get("https://up.test/")).await.unwrap();
        assert_eq!(body.status(), 204);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_has_no_status() {
        let transport = ScriptedTransport::sequence(vec![Err(TransportError::Connect("refused".into()))]);
        let (f, sleeper) = fetcher(transport, RetryPolicy::new(1, Duration::from_secs(1)));
        let err = f.fetch(&FetchRequest::get("https://up.test/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { last_status: None, attempts: 1, .. }));
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn empty_url_is_rejected_without_sending() {
        let transport = ScriptedTransport::sequence(vec![Ok(TransportResponse::new(200, "ok"))]);
        let (f, _) = fetcher(transport.clone(), RetryPolicy::new(3, Duration::ZERO));
        let err = f.fetch(&FetchRequest::get("  ")).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest { .. }));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential,
            max_delay: Duration::from_secs(10),
            rate_limit_multiplier: 3,
        };
        let status = AttemptFailure::Status { status: 500, excerpt: String::new() };
        assert_eq!(policy.delay_after(1, &status), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2, &status), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3, &status), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4, &status), Duration::from_secs(10));
        assert_eq!(policy.delay_after(1, &AttemptFailure::RateLimited), Duration::from_secs(6));
        assert_eq!(policy.delay_after(3, &AttemptFailure::RateLimited), Duration::from_secs(10));
    }

    #[test]
    fn fixed_and_rate_limited_waits_respect_the_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::new(3, Duration::from_secs(4)).with_rate_limit_multiplier(2)
        };
        let status = AttemptFailure::Status { status: 503, excerpt: String::new() };
        assert_eq!(policy.delay_after(1, &status), Duration::from_secs(4));
        assert_eq!(policy.delay_after(1, &AttemptFailure::RateLimited), Duration::from_secs(5));

        let tight = RetryPolicy { max_delay: Duration::from_secs(1), ..policy };
        assert_eq!(tight.delay_after(2, &status), Duration::from_secs(1));
    }

    #[test]
    fn policy_from_config() {
        let http = HttpConfig::default();
        let policy = RetryPolicy::from_config(&http);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff, Backoff::Fixed);
        assert_eq!(policy.rate_limit_multiplier, 2);
    }

    #[test]
    fn body_json_reports_malformed_payload() {
        let body = Body { status: 200, bytes: b"<html>".to_vec(), elapsed: Duration::ZERO, attempts: 1 };
        assert!(matches!(body.json::<Value>(), Err(TransformError::Malformed(_))));
    }

    #[test]
    fn excerpt_is_bounded() {
        let long = "x".repeat(1000);
        assert_eq!(excerpt(long.as_bytes()).chars().count(), EXCERPT_LEN + 1);
        assert_eq!(excerpt(b"  short \n"), "short");
    }
}
