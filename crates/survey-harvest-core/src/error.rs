//! Error taxonomy for the harvest engine.
//!
//! Attempt-level failures are described by [`FetchError`] and never escape
//! the retry boundary as errors; they are folded into a
//! [`FetchOutcome`](crate::models::FetchOutcome). Storage failures are
//! [`StoreError`]s. Only [`SchedulerError`] is job-fatal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification of a single failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// HTTP 429 or an equivalent throttling signal.
    RateLimited,
    /// Timeouts, connection resets, truncated bodies.
    TransientNetwork,
    /// 5xx responses and HTML error pages served with a 2xx status.
    UpstreamServer,
    /// Malformed request or parameters. Never retried.
    PermanentClient,
    /// Anything else.
    Unknown,
}

impl FetchErrorKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchErrorKind::PermanentClient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::RateLimited => "rate_limited",
            FetchErrorKind::TransientNetwork => "transient_network",
            FetchErrorKind::UpstreamServer => "upstream_server",
            FetchErrorKind::PermanentClient => "permanent_client",
            FetchErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one fetch attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    /// Server-provided hint (`Retry-After`) for throttled responses.
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Failures of the persistent object store or of the records kept in it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("refusing unsafe object path: {0}")]
    InvalidPath(String),

    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data at {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The logical name already holds different content and the caller
    /// did not ask to supersede it.
    #[error("conflicting content for {logical_name}: stored {existing}, incoming {incoming}")]
    Conflict {
        logical_name: String,
        existing: String,
        incoming: String,
    },
}

impl StoreError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serde(path: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Serde {
            path: path.into(),
            source,
        }
    }
}

/// Conditions that end a run with an error instead of a report.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("checkpoint store failure: {0}")]
    Checkpoint(#[source] StoreError),

    #[error("backlog source unreadable: {0}")]
    Backlog(#[source] StoreError),

    #[error("local storage fault: {0}")]
    Storage(#[source] StoreError),

    #[error("worker task aborted: {0}")]
    Worker(String),
}
