//! HTTPS transport to the upstream survey service.
//!
//! Implements the core [`Transport`] trait over an async `reqwest::Client`
//! configured for HTTPS only. Status classification happens in the core
//! fetch client; this layer only reports what came back.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use tracing::debug;

use survey_harvest_core::fetch::{RawResponse, Transport, TransportError, UpstreamRequest};

use crate::config::UpstreamConfig;

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        if !config.base_url.starts_with("https://") {
            bail!("refusing non-HTTPS upstream: {}", config.base_url);
        }
        let client = reqwest::Client::builder()
            .https_only(true)
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError> {
        let url = self.url(&request.endpoint);
        debug!(%url, "POST");

        let response = self
            .client
            .post(&url)
            .form(&request.form)
            .send()
            .await
            .map_err(map_error)?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let body = response.bytes().await.map_err(map_error)?.to_vec();

        Ok(RawResponse {
            status,
            content_type,
            content_length,
            body,
            retry_after,
        })
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        TransportError::Body(e.to_string())
    } else if e.is_builder() || e.is_redirect() {
        TransportError::Request(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// `Retry-After` as delta-seconds or an HTTP date. Dates in the past
/// yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after(" 120 ", Utc::now()),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 12:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_refuses_plain_http() {
        let config = UpstreamConfig {
            base_url: "http://survey.example".into(),
            ..UpstreamConfig::default()
        };
        assert!(HttpTransport::new(&config).is_err());
    }

    #[test]
    fn test_url_joins_endpoint() {
        let config = UpstreamConfig {
            base_url: "https://survey.example/epidinfo/".into(),
            ..UpstreamConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.url("dlwage.do"),
            "https://survey.example/epidinfo/dlwage.do"
        );
    }
}
