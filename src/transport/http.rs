use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{deadline_after, Transport, TransportError, TransportFactory};
use crate::cancel::CancelToken;
use crate::protocol::{decode_response, AnalysisResult, Query, ResponseLine};

/// When and how often failed HTTP calls are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each further failure.
    pub backoff_factor: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
    /// Status codes worth retrying.
    pub retry_statuses: Vec<u16>,
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_factor
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status.as_u16())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_factor: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Where the HTTP engine lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Base url, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Bearer credential.
    pub api_key: Option<String>,
    /// Verify server certificates (default `true`).
    pub verify_tls: bool,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
}

impl HttpConfig {
    /// Configuration with default retry policy, no credential, TLS verification on.
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpConfig {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            verify_tls: true,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the bearer credential.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Enable or disable certificate verification.
    pub fn with_verify_tls(mut self, value: bool) -> Self {
        self.verify_tls = value;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl TransportFactory for HttpConfig {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(HttpTransport::connect(self.clone())?))
    }
}

/// Answer of `GET /health`.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    /// `true` on HTTP 200.
    pub healthy: bool,
    /// Status code received.
    pub status: u16,
    /// Body, as JSON when it parses, as a string otherwise.
    pub info: serde_json::Value,
}

/// Transport to an engine served over HTTP (`POST /analyze`).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpConfig,
}

impl HttpTransport {
    /// Build the HTTP client. No request is made.
    ///
    /// # Errors
    ///
    /// [`TransportError::Unreachable`] if the client cannot be built (invalid credential
    /// characters, TLS backend failure).
    pub fn connect(config: HttpConfig) -> Result<HttpTransport, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| TransportError::Unreachable(format!("invalid api key: {e}")))?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
            let mut raw = HeaderValue::from_str(key)
                .map_err(|e| TransportError::Unreachable(format!("invalid api key: {e}")))?;
            raw.set_sensitive(true);
            headers.insert("x-api-key", raw);
        }
        if !config.verify_tls {
            warn!("TLS certificate verification disabled for {}", config.base_url);
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("analysis-runner/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!config.verify_tls)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("could not build client: {e}")))?;

        Ok(HttpTransport { client, config })
    }

    /// The configuration in use.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Probe `GET /health`.
    ///
    /// # Errors
    ///
    /// Transport-level failures only; a non-200 answer is reported as `healthy == false`.
    #[instrument(skip(self), fields(url = %self.config.base_url))]
    pub fn health(&self, timeout: Duration) -> Result<HealthStatus, TransportError> {
        let url = format!("{}/health", self.config.base_url);
        let response = self.execute(|| self.client.get(&url), deadline_after(timeout), None)?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        let info = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        Ok(HealthStatus {
            healthy: status == StatusCode::OK,
            status: status.as_u16(),
            info,
        })
    }

    /// Run a request with the retry policy, within `deadline`.
    ///
    /// Once `cancel` fires the deadline shrinks to the grace period, and no further attempt
    /// is made: a pending retry ends in [`TransportError::Timeout`].
    fn execute(
        &self,
        build: impl Fn() -> RequestBuilder,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<Response, TransportError> {
        let start = Instant::now();
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let cancelled = || cancel.is_some_and(CancelToken::is_cancelled);
        let mut deadline = deadline;
        let mut attempt = 1;
        loop {
            if let Some(cancel) = cancel.filter(|c| c.is_cancelled()) {
                deadline = deadline.min(deadline_after(cancel.grace()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(start.elapsed()));
            }

            let failure = match build().timeout(remaining).send() {
                Ok(response) if attempt < max_attempts && retry.should_retry(response.status()) => {
                    format!("HTTP {}", response.status())
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => return Err(TransportError::Timeout(start.elapsed())),
                Err(e) if attempt < max_attempts && (e.is_connect() || e.is_request()) => {
                    e.to_string()
                }
                Err(e) => return Err(TransportError::Unreachable(e.to_string())),
            };
            if cancelled() {
                debug!(attempt, "request failed ({failure}), cancelled before retry");
                return Err(TransportError::Timeout(start.elapsed()));
            }

            let delay = retry.backoff(attempt);
            warn!(attempt, max_attempts, ?delay, "request failed ({failure}), retrying");
            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                return Err(TransportError::Timeout(start.elapsed()));
            }
            if !pause(delay, cancel) {
                debug!(attempt, "cancelled during backoff");
                return Err(TransportError::Timeout(start.elapsed()));
            }
            attempt += 1;
        }
    }

    fn analyze(
        &self,
        query: &Query,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<AnalysisResult, TransportError> {
        let url = format!("{}/analyze", self.config.base_url);
        let request = query.to_request();
        let response = self.execute(
            || self.client.post(&url).json(&request),
            deadline_after(timeout),
            cancel,
        )?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TransportError::MalformedResponse(format!("unreadable body: {e}")))?;
        if !status.is_success() {
            return Err(TransportError::EngineRejected(format!(
                "HTTP {status}: {}",
                body.trim()
            )));
        }
        debug!(bytes = body.len(), "response received");

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::MalformedResponse(format!("invalid JSON: {e}")))?;
        match value.get("id").and_then(serde_json::Value::as_str) {
            Some(id) if id == query.id => {}
            Some(id) => {
                return Err(TransportError::MalformedResponse(format!(
                    "response id '{id}' does not match query id '{}'",
                    query.id
                )))
            }
            None => {
                return Err(TransportError::MalformedResponse(
                    "response has no id".to_string(),
                ))
            }
        }

        match decode_response(value) {
            ResponseLine::Answer(result) => Ok(result),
            ResponseLine::Rejected(msg) => Err(TransportError::EngineRejected(msg)),
            ResponseLine::Warning(msg) => Err(TransportError::MalformedResponse(format!(
                "warning without result: {msg}"
            ))),
            ResponseLine::Malformed(msg) => Err(TransportError::MalformedResponse(msg)),
            ResponseLine::Foreign(_) | ResponseLine::Noise => Err(
                TransportError::MalformedResponse("unexpected response shape".to_string()),
            ),
        }
    }
}

/// Sleep for `delay`, waking up early when `cancel` fires. False if cancelled.
fn pause(delay: Duration, cancel: Option<&CancelToken>) -> bool {
    const POLL: Duration = Duration::from_millis(20);
    let Some(cancel) = cancel else {
        thread::sleep(delay);
        return true;
    };
    let end = deadline_after(delay);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let left = end.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(POLL));
    }
}

impl Transport for HttpTransport {
    #[instrument(skip_all, fields(id = %query.id))]
    fn send(&mut self, query: &Query, timeout: Duration) -> Result<AnalysisResult, TransportError> {
        self.analyze(query, timeout, None)
    }

    #[instrument(skip_all, fields(id = %query.id))]
    fn send_cancellable(
        &mut self,
        query: &Query,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, TransportError> {
        self.analyze(query, timeout, Some(cancel))
    }
}
