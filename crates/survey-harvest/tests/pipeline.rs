//! The configured pipeline against a stand-in upstream and a real
//! directory.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;

use survey_harvest::config::{load_config, Config};
use survey_harvest::harvest::{run_with_transport, RunOptions, RunOutcome};
use survey_harvest::progress::ProgressMode;
use survey_harvest_core::fetch::{RawResponse, Transport, TransportError, UpstreamRequest};

/// Serves a four-row table for every month except those in `missing`,
/// which answer 404.
struct FakeUpstream {
    missing: Vec<String>,
    calls: AtomicUsize,
}

impl FakeUpstream {
    fn new(missing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            missing: missing.iter().map(|m| m.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for FakeUpstream {
    async fn send(&self, request: &UpstreamRequest) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let month = request
            .form
            .iter()
            .find(|(k, _)| k == "val(startSubPeriod)")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        if self.missing.contains(&month) {
            return Ok(RawResponse {
                status: 404,
                content_type: Some("text/html".into()),
                content_length: None,
                body: b"<html>not found</html>".to_vec(),
                retry_after: None,
            });
        }

        let body = format!(
            "area,cases,rate\nnorth,{m}0,1\nsouth,{m}1,2\neast,{m}2,3\nwest,{m}3,4\n",
            m = month
        )
        .into_bytes();
        Ok(RawResponse {
            status: 200,
            content_type: Some("text/csv".into()),
            content_length: Some(body.len() as u64),
            body,
            retry_after: None,
        })
    }
}

fn config(root: &Path) -> Config {
    let path = root.join("harvest.toml");
    fs::write(
        &path,
        format!(
            r#"[storage]
root = "{}/data"

[collection]
start_year = 2023
end_year = 2023
data_types = ["sentinel_monthly_age"]
refresh_recent_periods = 0

[rate_limit]
min_interval_ms = 0

[retry]
jitter_ms = 0

[quality]
anomaly_detection_enabled = false

[quality.size_limits.csv]
min = 20
max = 4096
"#,
            root.display()
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        dry_run: false,
        full: false,
        retry_failed: false,
        budget_secs: None,
        progress: ProgressMode::Off,
        today: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
    }
}

#[tokio::test]
async fn test_run_lands_files_and_writes_report() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let upstream = FakeUpstream::new(&[]);

    let outcome = run_with_transport(&cfg, upstream.clone(), options()).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    let RunOutcome::Finished { report, report_path } = outcome else {
        panic!("expected a finished run");
    };
    assert_eq!(report.metrics.landed, 12);
    assert_eq!(report.pending, 0);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 12);

    let data = tmp.path().join("data");
    let payload = data.join("raw/2023/01/sentinel_monthly_age_2023_01.csv");
    assert!(payload.exists(), "missing {}", payload.display());
    assert!(data.join("raw/2023/01/sentinel_monthly_age_2023_01.meta.json").exists());

    assert!(report_path.starts_with("logs/run_"));
    let written: serde_json::Value =
        serde_json::from_slice(&fs::read(data.join(&report_path)).unwrap()).unwrap();
    assert_eq!(written["phase"], "drained");
    assert!(written["run_id"].is_string());

    // Nothing left to do on the next run.
    let again = run_with_transport(&cfg, upstream.clone(), options()).await.unwrap();
    let RunOutcome::Finished { report, .. } = again else {
        panic!("expected a finished run");
    };
    assert_eq!(report.metrics.enumerated, 0);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_not_found_items_fail_permanently_and_set_exit_code() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let upstream = FakeUpstream::new(&["5"]);

    let outcome = run_with_transport(&cfg, upstream.clone(), options()).await.unwrap();
    assert_eq!(outcome.exit_code(), 1);
    let RunOutcome::Finished { report, .. } = outcome else {
        panic!("expected a finished run");
    };
    assert_eq!(report.metrics.landed, 11);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].item.period_key.index, 5);
    assert!(tmp.path().join("data/state/failed_items.json").exists());

    // The failure ledger keeps the item out of the next backlog.
    let next = run_with_transport(&cfg, upstream.clone(), options()).await.unwrap();
    let RunOutcome::Finished { report, .. } = next else {
        panic!("expected a finished run");
    };
    assert_eq!(report.metrics.enumerated, 0);
    assert!(!report.has_permanent_failures());

    // Unless asked to retry it.
    let retry = RunOptions {
        retry_failed: true,
        ..options()
    };
    let outcome = run_with_transport(&cfg, upstream.clone(), retry).await.unwrap();
    let RunOutcome::Finished { report, .. } = outcome else {
        panic!("expected a finished run");
    };
    assert_eq!(report.metrics.enumerated, 1);
}

#[tokio::test]
async fn test_dry_run_plans_without_fetching() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let upstream = FakeUpstream::new(&[]);

    let opts = RunOptions {
        dry_run: true,
        ..options()
    };
    let outcome = run_with_transport(&cfg, upstream.clone(), opts).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Planned { items: 12 }));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_budget_override_must_be_finite_and_positive() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let upstream = FakeUpstream::new(&[]);

    for budget in [f64::INFINITY, f64::NAN, -5.0] {
        let opts = RunOptions {
            budget_secs: Some(budget),
            ..options()
        };
        let err = match run_with_transport(&cfg, upstream.clone(), opts).await {
            Ok(_) => panic!("budget {} accepted", budget),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("--budget-secs"));
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}
