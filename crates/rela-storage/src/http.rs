//! Rate-limited HTTP fetching shared by source clients and the geocoder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 is handled separately with a fixed cooldown, see [`HttpFetcher::fetch`].
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between two outbound requests of one fetcher.
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            min_request_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Token bucket of one: every caller waits until `min_interval` has passed since
/// the previous request started.
#[derive(Debug)]
pub struct FixedDelayLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FixedDelayLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub json_body: Option<JsonValue>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            bearer: None,
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: HttpMethod::Post,
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: self.final_url.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) | Self::Connect(_) => RetryDisposition::Retryable,
            Self::Other(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: usize },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }
}

/// The wire seam: production uses reqwest, tests script responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FetchStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Default)]
struct FetchCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
}

pub struct HttpFetcher {
    label: String,
    transport: Arc<dyn HttpTransport>,
    limiter: FixedDelayLimiter,
    backoff: BackoffPolicy,
    counters: FetchCounters,
}

impl HttpFetcher {
    pub fn new(label: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(label, transport, &config))
    }

    pub fn with_transport(
        label: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        config: &HttpClientConfig,
    ) -> Self {
        Self {
            label: label.into(),
            transport,
            limiter: FixedDelayLimiter::new(config.min_request_interval),
            backoff: config.backoff,
            counters: FetchCounters::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            successful_requests: self.counters.success.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    /// Every attempt waits on the limiter first. Transient failures back off
    /// exponentially, 429 waits the fixed cooldown; both are bounded by
    /// `max_retries`. Any other non-success status is returned immediately.
    pub async fn fetch(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source = %self.label, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn fetch_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            self.limiter.wait().await;
            self.counters.total.fetch_add(1, Ordering::Relaxed);

            match self.transport.execute(request).await {
                Ok(resp) if resp.status.is_success() => {
                    self.counters.success.fetch_add(1, Ordering::Relaxed);
                    return Ok(resp);
                }
                Ok(resp) if resp.status == StatusCode::TOO_MANY_REQUESTS => {
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    if attempt < max_retries {
                        warn!(
                            attempt,
                            cooldown_secs = self.backoff.rate_limit_cooldown.as_secs(),
                            "rate limited; cooling down"
                        );
                        tokio::time::sleep(self.backoff.rate_limit_cooldown).await;
                        attempt += 1;
                        continue;
                    }
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(FetchError::RateLimited {
                        url: resp.final_url,
                        attempts: attempt + 1,
                    });
                }
                Ok(resp) => {
                    if classify_status(resp.status) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(FetchError::HttpStatus {
                        status: resp.status.as_u16(),
                        url: resp.final_url,
                    });
                }
                Err(err) => {
                    if err.disposition() == RetryDisposition::Retryable && attempt < max_retries {
                        warn!(attempt, error = %err, "transient request failure; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(FetchError::Transport(err));
                }
            }
        }
    }
}

/// Scripted transport for tests in this and downstream crates.
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub type Scripted = Result<FetchedResponse, TransportError>;

    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, response: Scripted) {
            if let Ok(mut queue) = self.responses.lock() {
                queue.push_back(response);
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    pub fn respond(status: u16, body: impl Into<Vec<u8>>) -> Scripted {
        Ok(FetchedResponse {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            final_url: "http://scripted.test/".to_string(),
            body: body.into(),
        })
    }

    pub fn respond_json(status: u16, body: &JsonValue) -> Scripted {
        respond(status, body.to_string())
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, TransportError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.clone());
            }
            let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
            next.unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
        }
    }

    pub fn instant_config() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(1),
            user_agent: None,
            min_request_interval: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                rate_limit_cooldown: Duration::ZERO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            rate_limit_cooldown: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_consecutive_requests() {
        let limiter = FixedDelayLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_cools_down_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new([
            respond(429, "slow down"),
            respond(200, "ok"),
        ]));
        let mut config = instant_config();
        config.backoff.rate_limit_cooldown = Duration::from_secs(60);
        let fetcher = HttpFetcher::with_transport("test", transport.clone(), &config);

        let start = Instant::now();
        let resp = fetcher.fetch(&HttpRequest::get("http://x/")).await.unwrap();
        assert_eq!(resp.text(), "ok");
        assert!(start.elapsed() >= Duration::from_secs(60));

        let stats = fetcher.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(stats.rate_limited, 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_are_bounded() {
        let transport = Arc::new(ScriptedTransport::new((0..10).map(|_| respond(429, ""))));
        let fetcher = HttpFetcher::with_transport("test", transport.clone(), &instant_config());

        let err = fetcher.fetch(&HttpRequest::get("http://x/")).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { attempts: 4, .. }));
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(fetcher.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn unauthorized_is_returned_without_retry() {
        let transport = Arc::new(ScriptedTransport::new([respond(401, ""), respond(200, "")]));
        let fetcher = HttpFetcher::with_transport("test", transport.clone(), &instant_config());

        let err = fetcher.fetch(&HttpRequest::get("http://x/")).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_with_backoff() {
        let transport = Arc::new(ScriptedTransport::new([
            Err(TransportError::Timeout("slow".into())),
            respond(503, ""),
            respond(200, "{\"ok\":true}"),
        ]));
        let fetcher = HttpFetcher::with_transport("test", transport.clone(), &instant_config());

        let resp = fetcher.fetch(&HttpRequest::get("http://x/")).await.unwrap();
        let value: JsonValue = resp.json().unwrap();
        assert_eq!(value["ok"], JsonValue::Bool(true));
        assert_eq!(fetcher.stats().total_requests, 3);
    }

    #[tokio::test]
    async fn non_retryable_transport_error_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new([Err(TransportError::Other("tls".into()))]));
        let fetcher = HttpFetcher::with_transport("test", transport, &instant_config());
        let err = fetcher.fetch(&HttpRequest::get("http://x/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(TransportError::Other(_))));
    }
}
