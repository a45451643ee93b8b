use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use swapledger_config::HttpConfig;
use swapledger_core_types::SwapSource;
use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use crate::telemetry::IngestionTelemetry;

const STATUS_BODY_PREVIEW_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{provider}: all {tried} endpoint(s) failed: {}", failures.join("; "))]
    ExhaustedEndpoints {
        provider: SwapSource,
        tried: usize,
        failures: Vec<String>,
    },
    #[error("{provider}: {endpoint} returned status {status}: {body}")]
    Status {
        provider: SwapSource,
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{provider}: invalid endpoint configuration: {reason}")]
    InvalidEndpoint { provider: SwapSource, reason: String },
    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    pub timeout_growth: Duration,
    pub max_request_timeout: Duration,
    pub max_attempts: u32,
    pub server_error_max_attempts: u32,
    pub base_delay_ms: u64,
    pub retry_after_floor: Duration,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
            timeout_growth: Duration::from_millis(config.timeout_growth_ms),
            max_request_timeout: Duration::from_millis(
                config.max_request_timeout_ms.max(config.request_timeout_ms),
            ),
            max_attempts: config.max_attempts.max(1),
            server_error_max_attempts: config.server_error_max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            retry_after_floor: Duration::from_millis(config.retry_after_floor_ms),
            max_backoff_ms: config.max_backoff_ms,
            jitter_ms: config.jitter_ms,
        }
    }

    /// `attempt` is zero-based.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self
            .timeout_growth
            .saturating_mul(attempt)
            .saturating_add(self.request_timeout);
        grown.min(self.max_request_timeout)
    }

    /// Wait before retrying `attempt` (zero-based) against the endpoint `key`.
    ///
    /// Plain retries back off exponentially up to `max_backoff_ms`. A 429
    /// passes `Some(retry_after)` with whatever the server asked for (zero when
    /// it sent no usable header); that wait is floored by `retry_after_floor`
    /// and is not capped.
    pub fn retry_delay(&self, attempt: u32, key: &str, retry_after: Option<Duration>) -> Duration {
        let base_ms = self.base_delay_ms.max(1);
        let cap_ms = self.max_backoff_ms.max(base_ms);
        let backoff_ms = base_ms.saturating_mul(1u64 << attempt.min(10)).min(cap_ms);
        let backoff = Duration::from_millis(backoff_ms.saturating_add(self.jitter(key, attempt)));
        match retry_after {
            Some(requested) => backoff.max(requested).max(self.retry_after_floor),
            None => backoff,
        }
    }

    /// Stable per endpoint and attempt.
    fn jitter(&self, key: &str, attempt: u32) -> u64 {
        if self.jitter_ms == 0 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        (key, attempt).hash(&mut hasher);
        hasher.finish() % (self.jitter_ms + 1)
    }
}

/// Candidate URLs for one provider. The last winner is tried first.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    urls: Vec<String>,
    preferred: usize,
}

impl EndpointSet {
    pub fn new(source: SwapSource, urls: &[String]) -> Result<Self, FetchError> {
        let urls: Vec<String> = urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(FetchError::InvalidEndpoint {
                provider: source,
                reason: "no endpoints configured".to_string(),
            });
        }
        for url in &urls {
            reqwest::Url::parse(url).map_err(|error| FetchError::InvalidEndpoint {
                provider: source,
                reason: format!("{}: {error}", redacted_endpoint_label(url)),
            })?;
        }
        Ok(Self { urls, preferred: 0 })
    }

    pub fn preferred(&self) -> &str {
        &self.urls[self.preferred]
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    fn candidates(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.urls.len());
        order.push(self.preferred);
        order.extend((0..self.urls.len()).filter(|idx| *idx != self.preferred));
        order
    }

    fn promote(&mut self, idx: usize) {
        if idx < self.urls.len() {
            self.preferred = idx;
        }
    }
}

enum AttemptError {
    RateLimited { retry_after: Option<Duration> },
    ServerError { status: u16 },
    Timeout(String),
    Unreachable(String),
    Decode(String),
    Status { status: u16, body: String },
}

pub struct ApiClient {
    source: SwapSource,
    http: reqwest::Client,
    policy: RetryPolicy,
    headers: HeaderMap,
    inter_request_delay: Duration,
    telemetry: Arc<IngestionTelemetry>,
}

impl ApiClient {
    pub fn new(
        source: SwapSource,
        config: &HttpConfig,
        inter_request_delay_ms: u64,
        telemetry: Arc<IngestionTelemetry>,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            source,
            http,
            policy: RetryPolicy::from_config(config),
            headers: HeaderMap::new(),
            inter_request_delay: Duration::from_millis(inter_request_delay_ms),
            telemetry,
        })
    }

    /// Adds a header sent with every request. Blank values are ignored.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self, FetchError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(self);
        }
        let header_value =
            HeaderValue::from_str(value).map_err(|error| FetchError::InvalidEndpoint {
                provider: self.source,
                reason: format!("invalid {name} header value: {error}"),
            })?;
        self.headers
            .insert(HeaderName::from_static(name), header_value);
        Ok(self)
    }

    pub fn source(&self) -> SwapSource {
        self.source
    }

    pub fn telemetry(&self) -> &Arc<IngestionTelemetry> {
        &self.telemetry
    }

    pub async fn fetch_json(
        &self,
        endpoints: &mut EndpointSet,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        let candidates = endpoints.candidates();
        let preferred = endpoints.preferred;
        let mut failures = Vec::with_capacity(candidates.len());

        for idx in candidates.iter().copied() {
            let url = endpoints.urls[idx].clone();
            let label = redacted_endpoint_label(&url);
            match self.fetch_from_candidate(&url, &label, query).await {
                Ok(body) => {
                    if idx != preferred {
                        self.telemetry
                            .endpoint_fallbacks
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(source = %self.source, endpoint = %label, "promoting fallback endpoint");
                    }
                    endpoints.promote(idx);
                    if !self.inter_request_delay.is_zero() {
                        time::sleep(self.inter_request_delay).await;
                    }
                    return Ok(body);
                }
                Err(CandidateOutcome::Fatal(error)) => return Err(error),
                Err(CandidateOutcome::GaveUp(reason)) => {
                    warn!(
                        source = %self.source,
                        endpoint = %label,
                        reason = %reason,
                        "endpoint failed, trying next candidate"
                    );
                    failures.push(format!("{label}: {reason}"));
                }
            }
        }

        self.telemetry
            .endpoints_exhausted
            .fetch_add(1, Ordering::Relaxed);
        Err(FetchError::ExhaustedEndpoints {
            provider: self.source,
            tried: candidates.len(),
            failures,
        })
    }

    async fn fetch_from_candidate(
        &self,
        url: &str,
        label: &str,
        query: &[(&str, String)],
    ) -> Result<Value, CandidateOutcome> {
        let mut attempt: u32 = 0;
        let mut server_errors: u32 = 0;
        loop {
            let timeout = self.policy.timeout_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            let error = match self.attempt_once(url, query, timeout).await {
                Ok(body) => return Ok(body),
                Err(error) => error,
            };
            let delay = match error {
                AttemptError::RateLimited { retry_after } => {
                    self.telemetry.http_429.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.policy.max_attempts {
                        return Err(CandidateOutcome::GaveUp(format!(
                            "rate limited after {attempt} attempt(s)"
                        )));
                    }
                    self.policy
                        .retry_delay(attempt - 1, url, Some(retry_after.unwrap_or_default()))
                }
                AttemptError::ServerError { status } => {
                    self.telemetry.http_5xx.fetch_add(1, Ordering::Relaxed);
                    server_errors = server_errors.saturating_add(1);
                    if server_errors >= self.policy.server_error_max_attempts
                        || attempt >= self.policy.max_attempts
                    {
                        return Err(CandidateOutcome::GaveUp(format!(
                            "status {status} after {attempt} attempt(s)"
                        )));
                    }
                    self.policy.retry_delay(attempt - 1, url, None)
                }
                AttemptError::Timeout(detail) => {
                    self.telemetry.timeouts.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.policy.max_attempts {
                        return Err(CandidateOutcome::GaveUp(format!(
                            "timed out after {attempt} attempt(s): {detail}"
                        )));
                    }
                    self.policy.retry_delay(attempt - 1, url, None)
                }
                AttemptError::Unreachable(detail) => {
                    return Err(CandidateOutcome::GaveUp(detail));
                }
                AttemptError::Decode(detail) => {
                    return Err(CandidateOutcome::GaveUp(format!("undecodable body: {detail}")));
                }
                AttemptError::Status { status, body } => {
                    return Err(CandidateOutcome::Fatal(FetchError::Status {
                        provider: self.source,
                        endpoint: label.to_string(),
                        status,
                        body,
                    }));
                }
            };
            debug!(
                source = %self.source,
                endpoint = %label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            time::sleep(delay).await;
        }
    }

    async fn attempt_once(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AttemptError::RateLimited {
                retry_after: parse_retry_after(&response),
            });
        }
        if matches!(status.as_u16(), 502..=504) {
            return Err(AttemptError::ServerError {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body: body.chars().take(STATUS_BODY_PREVIEW_CHARS).collect(),
            });
        }

        let bytes = response.bytes().await.map_err(classify_send_error)?;
        serde_json::from_slice(&bytes).map_err(|error| AttemptError::Decode(error.to_string()))
    }
}

enum CandidateOutcome {
    GaveUp(String),
    Fatal(FetchError),
}

fn classify_send_error(error: reqwest::Error) -> AttemptError {
    let kind = classify_request_error(&error);
    let detail = format!("{kind}: {error}");
    match kind {
        "timeout" => AttemptError::Timeout(detail),
        "decode" | "body" => AttemptError::Decode(detail),
        _ => AttemptError::Unreachable(detail),
    }
}

/// Only the delta-seconds form; an HTTP-date falls back to the floor.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Scheme, host and port only; paths and query strings may carry keys.
pub fn redacted_endpoint_label(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return "unknown".to_string();
    }
    match reqwest::Url::parse(endpoint) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("unknown");
            match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            }
        }
        Err(_) => "invalid_endpoint".to_string(),
    }
}

fn classify_request_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connect"
    } else if error.is_request() {
        "request"
    } else if error.is_body() {
        "body"
    } else if error.is_decode() {
        "decode"
    } else if error.is_redirect() {
        "redirect"
    } else {
        "other"
    }
}
