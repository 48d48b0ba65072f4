//! One logical retrieval against the upstream survey service.
//!
//! The network itself sits behind [`Transport`]; [`FetchClient`] composes
//! it with the shared [`RateLimiter`], a per-attempt timeout and the
//! [`RetryExecutor`], and classifies every response before it can be
//! mistaken for a payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::config::RetryPolicy;
use crate::error::{FetchError, FetchErrorKind};
use crate::models::{FetchOutcome, WorkItem};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;

/// A form POST to one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Endpoint path relative to the configured base URL, e.g. `dlwage.do`.
    pub endpoint: String,
    pub form: Vec<(String, String)>,
}

/// What a transport hands back for a completed HTTP exchange.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Declared `Content-Length`, if the server sent one.
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("response body interrupted: {0}")]
    Body(String),
    /// The request could not be built (bad URL, non-HTTPS target).
    #[error("invalid request: {0}")]
    Request(String),
    #[error("{0}")]
    Other(String),
}

/// Capability to send one request upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError>;
}

/// Anything that turns a [`WorkItem`] into a [`FetchOutcome`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> FetchOutcome;
}

/// Build the upstream form for a single-period table download.
pub fn build_request(item: &WorkItem) -> UpstreamRequest {
    let year = item.period_key.year.to_string();
    let sub_period = item.period_key.index.to_string();
    let src = &item.source;
    let form = vec![
        ("val(reportType)", src.report_type.clone()),
        ("val(prefCode)", src.pref_code.clone()),
        ("val(hcCode)", src.hc_code.clone()),
        ("val(epidCode)", src.epid_code.clone()),
        ("val(startYear)", year.clone()),
        ("val(startSubPeriod)", sub_period.clone()),
        ("val(endYear)", year),
        ("val(endSubPeriod)", sub_period),
        ("val(totalMode)", src.total_mode.clone()),
    ];
    UpstreamRequest {
        endpoint: src.endpoint.clone(),
        form: form
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    }
}

/// Decide whether a completed exchange carries a usable payload.
pub fn classify_response(resp: RawResponse) -> Result<Vec<u8>, FetchError> {
    let status = resp.status;
    match status {
        200..=299 => {}
        429 => {
            return Err(FetchError::new(FetchErrorKind::RateLimited, "HTTP 429")
                .with_retry_after(resp.retry_after))
        }
        408 => {
            return Err(FetchError::new(
                FetchErrorKind::TransientNetwork,
                "HTTP 408",
            ))
        }
        400..=499 => {
            return Err(FetchError::new(
                FetchErrorKind::PermanentClient,
                format!("HTTP {}", status),
            ))
        }
        500..=599 => {
            return Err(FetchError::new(
                FetchErrorKind::UpstreamServer,
                format!("HTTP {}", status),
            ))
        }
        _ => {
            return Err(FetchError::new(
                FetchErrorKind::Unknown,
                format!("unexpected HTTP status {}", status),
            ))
        }
    }

    // The service answers some failures with a 200 and an HTML error page.
    let is_html = resp
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
        || looks_like_html(&resp.body);
    if is_html {
        return Err(FetchError::new(
            FetchErrorKind::UpstreamServer,
            "HTML error page instead of table",
        ));
    }

    if let Some(declared) = resp.content_length {
        if declared != resp.body.len() as u64 {
            return Err(FetchError::new(
                FetchErrorKind::TransientNetwork,
                format!(
                    "truncated body: {} of {} bytes",
                    resp.body.len(),
                    declared
                ),
            ));
        }
    }

    if resp.body.is_empty() {
        return Err(FetchError::new(FetchErrorKind::Unknown, "empty response body"));
    }

    Ok(resp.body)
}

fn looks_like_html(body: &[u8]) -> bool {
    let head: Vec<u8> = body
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(14)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    head.starts_with(b"<!doctype html") || head.starts_with(b"<html")
}

pub fn classify_transport(err: &TransportError) -> FetchError {
    let kind = match err {
        TransportError::Timeout | TransportError::Connect(_) | TransportError::Body(_) => {
            FetchErrorKind::TransientNetwork
        }
        TransportError::Request(_) => FetchErrorKind::PermanentClient,
        TransportError::Other(_) => FetchErrorKind::Unknown,
    };
    FetchError::new(kind, err.to_string())
}

/// Rate-limited, retried, timeout-bounded fetcher.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    attempt_timeout: Duration,
}

impl FetchClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        let retry = RetryExecutor::new(policy).with_limiter(limiter.clone());
        Self {
            transport,
            limiter,
            retry,
            attempt_timeout,
        }
    }

    /// One paced, time-bounded exchange.
    async fn attempt(&self, request: &UpstreamRequest) -> Result<Vec<u8>, FetchError> {
        self.limiter.acquire().await;
        match tokio::time::timeout(self.attempt_timeout, self.transport.send(request)).await {
            Err(_) => Err(FetchError::new(
                FetchErrorKind::TransientNetwork,
                format!("attempt exceeded {:?}", self.attempt_timeout),
            )),
            Ok(Err(e)) => Err(classify_transport(&e)),
            Ok(Ok(resp)) => classify_response(resp),
        }
    }
}

#[async_trait]
impl Fetcher for FetchClient {
    #[instrument(name = "fetch", skip_all, fields(item = %item))]
    async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
        let request = build_request(item);
        let request = &request;
        self.retry.run(move |_| self.attempt(request)).await
    }
}
