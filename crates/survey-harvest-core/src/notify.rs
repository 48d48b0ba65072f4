//! Operator notification seam.
//!
//! The engine raises notices for permanent item failures, quarantined
//! payloads and budget suspensions. Delivery belongs to the application.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What a notice is about. Sinks filter on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PermanentFailure,
    Quarantine,
    Suspended,
    RunSummary,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NoticeKind, severity: Severity, summary: &str, context: Value);
}

/// Discards everything.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _kind: NoticeKind, _severity: Severity, _summary: &str, _context: Value) {}
}

/// Forwards at most `limit` notices; the rest are counted and reported by
/// [`finish`](CappedNotifier::finish) as a single summary.
pub struct CappedNotifier {
    inner: Arc<dyn Notifier>,
    limit: usize,
    sent: AtomicUsize,
    suppressed: AtomicUsize,
}

impl CappedNotifier {
    pub fn new(inner: Arc<dyn Notifier>, limit: usize) -> Self {
        Self {
            inner,
            limit,
            sent: AtomicUsize::new(0),
            suppressed: AtomicUsize::new(0),
        }
    }

    pub fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Emit the overflow summary, if anything was held back.
    pub async fn finish(&self) {
        let suppressed = self.suppressed.swap(0, Ordering::SeqCst);
        if suppressed > 0 {
            self.inner
                .notify(
                    NoticeKind::RunSummary,
                    Severity::Warning,
                    &format!("{} further notices suppressed this run", suppressed),
                    json!({ "suppressed": suppressed, "limit": self.limit }),
                )
                .await;
        }
    }
}

#[async_trait]
impl Notifier for CappedNotifier {
    async fn notify(&self, kind: NoticeKind, severity: Severity, summary: &str, context: Value) {
        let slot = self.sent.fetch_add(1, Ordering::SeqCst);
        if slot >= self.limit {
            self.suppressed.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.inner.notify(kind, severity, summary, context).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(NoticeKind, String)>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, kind: NoticeKind, _severity: Severity, summary: &str, _context: Value) {
            self.seen.lock().unwrap().push((kind, summary.to_string()));
        }
    }

    #[tokio::test]
    async fn test_cap_suppresses_and_summarizes() {
        let rec = Arc::new(Recorder::default());
        let capped = CappedNotifier::new(rec.clone(), 2);
        for i in 0..5 {
            capped
                .notify(NoticeKind::Quarantine, Severity::Warning, &format!("q{}", i), Value::Null)
                .await;
        }
        assert_eq!(capped.suppressed(), 3);
        capped.finish().await;

        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, "q0");
        assert_eq!(seen[2].0, NoticeKind::RunSummary);
        assert!(seen[2].1.contains("3 further notices"));
    }

    #[tokio::test]
    async fn test_finish_is_silent_under_cap() {
        let rec = Arc::new(Recorder::default());
        let capped = CappedNotifier::new(rec.clone(), 10);
        capped
            .notify(NoticeKind::Suspended, Severity::Info, "suspended", Value::Null)
            .await;
        capped.finish().await;
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
    }
}
