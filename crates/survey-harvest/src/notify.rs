//! Operator notification sinks.
//!
//! Every notice is logged. When `[notifications] enabled = true` it is
//! also appended as one JSON line to the outbox file under the storage
//! root, where an external job can pick it up (open an issue, send mail).
//! Per-kind switches filter what is sent; what passes the filter goes
//! through the core [`CappedNotifier`] so one bad run cannot flood the
//! outbox.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use survey_harvest_core::notify::{CappedNotifier, NoticeKind, Notifier, Severity};
use survey_harvest_core::store::ObjectStore;

use crate::config::NotificationsConfig;

pub struct OutboxNotifier {
    config: NotificationsConfig,
    store: Arc<dyn ObjectStore>,
}

impl OutboxNotifier {
    pub fn new(config: NotificationsConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, kind: NoticeKind, severity: Severity, summary: &str, context: Value) {
        match severity {
            Severity::Info => info!(?kind, %context, "notice: {}", summary),
            Severity::Warning => warn!(?kind, %context, "notice: {}", summary),
            Severity::Error => error!(?kind, %context, "notice: {}", summary),
        }
        if !self.config.enabled {
            return;
        }

        let line = json!({
            "at": Utc::now(),
            "kind": kind,
            "severity": severity,
            "summary": summary,
            "context": context,
        });
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        if let Err(e) = self.store.append_bytes(&self.config.outbox, &bytes).await {
            warn!(outbox = %self.config.outbox, error = %e, "failed to write notice");
        }
    }
}

/// Drops notice kinds switched off in the config before they reach the
/// cap.
pub struct FilteredNotifier {
    config: NotificationsConfig,
    inner: CappedNotifier,
}

impl FilteredNotifier {
    fn wants(&self, kind: NoticeKind) -> bool {
        match kind {
            NoticeKind::PermanentFailure => self.config.on_failure,
            NoticeKind::Quarantine => self.config.on_anomaly,
            NoticeKind::Suspended => self.config.on_suspend,
            NoticeKind::RunSummary => true,
        }
    }

    /// Flush the overflow summary of the underlying cap.
    pub async fn finish(&self) {
        self.inner.finish().await;
    }
}

#[async_trait]
impl Notifier for FilteredNotifier {
    async fn notify(&self, kind: NoticeKind, severity: Severity, summary: &str, context: Value) {
        if self.wants(kind) {
            self.inner.notify(kind, severity, summary, context).await;
        }
    }
}

/// The configured sink: filtered, then capped at `max_per_run` notices.
pub fn build_notifier(config: &NotificationsConfig, store: Arc<dyn ObjectStore>) -> Arc<FilteredNotifier> {
    let sink: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(config.clone(), store));
    Arc::new(FilteredNotifier {
        config: config.clone(),
        inner: CappedNotifier::new(sink, config.max_per_run),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use survey_harvest_core::store::memory::MemoryObjectStore;

    fn lines(bytes: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_enabled_sink_appends_jsonl() {
        let mem = Arc::new(MemoryObjectStore::new());
        let config = NotificationsConfig {
            enabled: true,
            ..NotificationsConfig::default()
        };
        let sink = OutboxNotifier::new(config, mem.clone());
        sink.notify(
            NoticeKind::PermanentFailure,
            Severity::Error,
            "gave up on notifiable_weekly/2024-03",
            json!({"item": "notifiable_weekly/2024-03"}),
        )
        .await;

        let written = lines(&mem.read_bytes("logs/notifications.jsonl").await.unwrap());
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["kind"], "permanent_failure");
        assert_eq!(written[0]["severity"], "error");
        assert_eq!(written[0]["context"]["item"], "notifiable_weekly/2024-03");
    }

    #[tokio::test]
    async fn test_disabled_sink_writes_nothing() {
        let mem = Arc::new(MemoryObjectStore::new());
        let sink = OutboxNotifier::new(NotificationsConfig::default(), mem.clone());
        sink.notify(NoticeKind::Suspended, Severity::Warning, "suspended", json!({}))
            .await;
        assert!(!mem.exists("logs/notifications.jsonl").await.unwrap());
    }

    #[tokio::test]
    async fn test_filtered_kinds_do_not_use_up_the_cap() {
        let mem = Arc::new(MemoryObjectStore::new());
        let config = NotificationsConfig {
            enabled: true,
            on_anomaly: false,
            max_per_run: 1,
            ..NotificationsConfig::default()
        };
        let notifier = build_notifier(&config, mem.clone());
        notifier
            .notify(NoticeKind::Quarantine, Severity::Warning, "q", json!({}))
            .await;
        notifier
            .notify(NoticeKind::Suspended, Severity::Warning, "s", json!({}))
            .await;
        notifier.finish().await;
        let written = lines(&mem.read_bytes("logs/notifications.jsonl").await.unwrap());
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["kind"], "suspended");
    }

    #[tokio::test]
    async fn test_cap_applies_to_outbox() {
        let mem = Arc::new(MemoryObjectStore::new());
        let config = NotificationsConfig {
            enabled: true,
            max_per_run: 2,
            ..NotificationsConfig::default()
        };
        let notifier = build_notifier(&config, mem.clone());
        for i in 0..5 {
            notifier
                .notify(
                    NoticeKind::PermanentFailure,
                    Severity::Error,
                    &format!("failure {}", i),
                    json!({}),
                )
                .await;
        }
        notifier.finish().await;

        let written = lines(&mem.read_bytes("logs/notifications.jsonl").await.unwrap());
        assert_eq!(written.len(), 3);
        assert_eq!(written[2]["kind"], "run_summary");
    }
}
