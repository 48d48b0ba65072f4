//! The checkpointed, budget-aware harvest driver.
//!
//! ```text
//! ENUMERATING ──▶ RUNNING ◀──▶ CHECKPOINTING
//!                    │
//!                    ├──▶ DRAINED    backlog empty, checkpoint cleared
//!                    └──▶ SUSPENDED  soft budget spent, checkpoint saved
//! ```
//!
//! Workers run the fetch, validate and land pipeline for one item each, up
//! to `max_parallelism` at a time. Only the driver loop touches
//! [`ExecutionState`]: it applies each worker's resolution as it arrives,
//! so no completion can be lost to a concurrent update. An item leaves
//! `pending` only after its resolution is recorded.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::backlog::{self, BacklogDefinition};
use crate::checkpoint::{CheckpointStore, ExecutionState, FailedItem, FailureLedger};
use crate::config::SchedulerConfig;
use crate::content::{compute_hash, ContentStore, LandMetadata, LandMode, Landing, LandingKind};
use crate::error::{FetchErrorKind, SchedulerError, StoreError};
use crate::fetch::Fetcher;
use crate::metrics::{MetricsRecorder, RunMetrics};
use crate::models::{FetchOutcome, QualityVerdict, WorkItem};
use crate::notify::{NoticeKind, Notifier, Severity};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::quality::{route, GateDecision, QualityGate, QuarantineReason};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Enumerating,
    Running,
    Checkpointing,
    Drained,
    Suspended,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Enumerating => "enumerating",
            Phase::Running => "running",
            Phase::Checkpointing => "checkpointing",
            Phase::Drained => "drained",
            Phase::Suspended => "suspended",
        }
    }
}

/// A payload isolated during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedItem {
    pub item: String,
    pub reason: QuarantineReason,
    pub path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub anomaly_score: f64,
    /// Whether the item was put back for one more fetch.
    pub refetch: bool,
}

/// Summary of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub phase: Phase,
    pub resumed: bool,
    pub invocations: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metrics: RunMetrics,
    pub quarantined: Vec<QuarantinedItem>,
    /// Items given up on during this run.
    pub failed: Vec<FailedItem>,
    pub pending: usize,
    pub progress_fraction: f64,
}

impl RunReport {
    pub fn has_permanent_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Engine components the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub gate: Arc<QualityGate>,
    pub content: Arc<ContentStore>,
    /// Where the checkpoint and failure ledger live.
    pub state_store: Arc<dyn ObjectStore>,
    pub notifier: Arc<dyn Notifier>,
    pub progress: Arc<dyn ProgressReporter>,
}

/// How one item's pass through the pipeline ended.
enum Resolution {
    Landed(Landing),
    Duplicate,
    Quarantined {
        reason: QuarantineReason,
        path: String,
        verdict: QualityVerdict,
    },
    FetchFailed,
    Conflict(StoreError),
    StorageFault(StoreError),
}

struct Processed {
    item: WorkItem,
    fetch: FetchOutcome,
    resolution: Resolution,
}

/// Fetch → validate → land for a single item.
struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    gate: Arc<QualityGate>,
    content: Arc<ContentStore>,
    land_mode: LandMode,
}

impl Pipeline {
    async fn process(&self, item: WorkItem) -> Processed {
        let mut fetch = self.fetcher.fetch(&item).await;
        let payload = match fetch.payload.take() {
            Some(payload) if fetch.success => payload,
            _ => {
                return Processed {
                    item,
                    fetch,
                    resolution: Resolution::FetchFailed,
                }
            }
        };

        let resolution = self.screen_and_land(&item, &payload).await;
        Processed {
            item,
            fetch,
            resolution,
        }
    }

    async fn screen_and_land(&self, item: &WorkItem, payload: &[u8]) -> Resolution {
        let hash = compute_hash(payload);
        if self
            .content
            .is_duplicate(&hash, &item.data_type, item.period_key)
            .await
        {
            return Resolution::Duplicate;
        }

        let window = self.gate.config().baseline_window;
        let baseline = self.content.baseline(item, window).await;
        let verdict = self.gate.evaluate(payload, item, &baseline);

        match route(&verdict, self.gate.config()) {
            GateDecision::Land => {
                let meta = LandMetadata::from_verdict(item, &verdict);
                match self.content.land(payload, meta, self.land_mode).await {
                    Ok(landing) => Resolution::Landed(landing),
                    Err(e @ StoreError::Conflict { .. }) => Resolution::Conflict(e),
                    Err(e) => Resolution::StorageFault(e),
                }
            }
            GateDecision::Quarantine(reason) => {
                match self.content.quarantine(payload, item, reason, &verdict).await {
                    Ok(path) => Resolution::Quarantined {
                        reason,
                        path,
                        verdict,
                    },
                    Err(e) => Resolution::StorageFault(e),
                }
            }
        }
    }
}

pub struct ExecutionScheduler {
    config: SchedulerConfig,
    backlog: BacklogDefinition,
    parts: Collaborators,
    checkpoint_path: String,
    failures_path: String,
    retry_failed: bool,
    today: Option<NaiveDate>,
}

impl ExecutionScheduler {
    pub fn new(config: SchedulerConfig, backlog: BacklogDefinition, parts: Collaborators) -> Self {
        Self {
            config,
            backlog,
            parts,
            checkpoint_path: "state/checkpoint.json".to_string(),
            failures_path: "state/failed_items.json".to_string(),
            retry_failed: false,
            today: None,
        }
    }

    /// Object paths of the checkpoint and the failure ledger.
    pub fn with_state_paths(mut self, checkpoint: impl Into<String>, failures: impl Into<String>) -> Self {
        self.checkpoint_path = checkpoint.into();
        self.failures_path = failures.into();
        self
    }

    /// Include previously abandoned items in fresh enumerations.
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    /// Pin the date used to decide which periods are due.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.parts.state_store.clone(), self.checkpoint_path.clone())
    }

    async fn failure_ledger(&self) -> Result<FailureLedger, SchedulerError> {
        FailureLedger::open(self.parts.state_store.clone(), self.failures_path.clone())
            .await
            .map_err(SchedulerError::Backlog)
    }

    /// ENUMERATING: resume from a well-formed checkpoint or build a fresh
    /// backlog from configured coverage and landed records.
    pub async fn plan(&self) -> Result<(ExecutionState, bool), SchedulerError> {
        if let Some(state) = self
            .checkpoints()
            .load()
            .await
            .map_err(SchedulerError::Checkpoint)?
        {
            info!(pending = state.pending.len(), "resuming from checkpoint");
            return Ok((state, true));
        }

        let excluded = if self.retry_failed {
            BTreeSet::new()
        } else {
            self.failure_ledger().await?.keys()
        };
        let landed = self.parts.content.landed_keys().await;
        let items = backlog::enumerate(&self.backlog, &landed, &excluded, self.today());
        info!(
            items = items.len(),
            landed = landed.len(),
            excluded = excluded.len(),
            "backlog enumerated"
        );
        Ok((ExecutionState::fresh(items, Utc::now()), false))
    }

    #[instrument(name = "harvest", skip_all)]
    pub async fn run(&self) -> Result<RunReport, SchedulerError> {
        let started = Instant::now();
        let started_at = Utc::now();
        // None when the budget reaches past what `Instant` can represent.
        let deadline = started.checked_add(self.config.soft_budget());
        let parallelism = self.config.max_parallelism.max(1);
        let checkpoints = self.checkpoints();
        let mut failures = self.failure_ledger().await?;
        let mut metrics = MetricsRecorder::new();
        let progress = &self.parts.progress;

        let (mut state, resumed) = self.plan().await?;
        state.invocations += 1;
        let mut queue: VecDeque<WorkItem> = std::mem::take(&mut state.pending).into();
        metrics.enumerated(queue.len());
        progress.report(ProgressEvent::Enumerated {
            total: queue.len() as u64,
            resumed,
        });

        let pipeline = Arc::new(Pipeline {
            fetcher: self.parts.fetcher.clone(),
            gate: self.parts.gate.clone(),
            content: self.parts.content.clone(),
            land_mode: if self.config.supersede_on_revision {
                LandMode::Supersede
            } else {
                LandMode::New
            },
        });

        let mut in_flight: Vec<WorkItem> = Vec::new();
        let mut workers: JoinSet<Processed> = JoinSet::new();
        let mut quarantined = Vec::new();
        let mut failed = Vec::new();
        let mut budget_spent = false;
        let mut fatal: Option<SchedulerError> = None;
        let mut since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        debug!(phase = Phase::Running.as_str(), parallelism, "dispatching");
        loop {
            while !budget_spent && fatal.is_none() && workers.len() < parallelism {
                if queue.is_empty() {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    budget_spent = true;
                    warn!(
                        pending = queue.len(),
                        "soft time budget spent; no further dispatch"
                    );
                    break;
                }
                let Some(item) = queue.pop_front() else {
                    break;
                };
                in_flight.push(item.clone());
                let pipeline = pipeline.clone();
                workers.spawn(async move { pipeline.process(item).await });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let done = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The item stays in `in_flight` and is checkpointed as pending.
                    error!(error = %e, "worker task failed");
                    fatal.get_or_insert(SchedulerError::Worker(e.to_string()));
                    continue;
                }
            };
            if let Some(pos) = in_flight.iter().position(|i| *i == done.item) {
                in_flight.swap_remove(pos);
            }

            metrics.fetch(&done.fetch);
            let key = done.item.key();
            let outcome = match done.resolution {
                Resolution::Landed(landing) => {
                    metrics.landed(
                        landing.record.byte_size,
                        landing.kind == LandingKind::Aliased,
                        matches!(landing.kind, LandingKind::Superseded { .. }),
                    );
                    failures.resolve(&key);
                    state.completed.insert(done.item.clone());
                    "landed"
                }
                Resolution::Duplicate => {
                    metrics.duplicate();
                    failures.resolve(&key);
                    state.completed.insert(done.item.clone());
                    "duplicate"
                }
                Resolution::Quarantined {
                    reason,
                    path,
                    verdict,
                } => {
                    let allowed = match reason {
                        QuarantineReason::Rejected => self.config.refetch_on_validation_failure,
                        QuarantineReason::Anomalous => self.config.refetch_on_anomaly,
                    };
                    let refetch = allowed && state.refetched.insert(key.clone());
                    let entry = QuarantinedItem {
                        item: key.clone(),
                        reason,
                        path,
                        errors: verdict.errors,
                        warnings: verdict.warnings,
                        anomaly_score: verdict.anomaly_score,
                        refetch,
                    };
                    if refetch {
                        metrics.requeued();
                        queue.push_back(done.item.clone());
                        quarantined.push(entry);
                        "requeued"
                    } else {
                        metrics.quarantined();
                        state.completed.insert(done.item.clone());
                        self.parts
                            .notifier
                            .notify(
                                NoticeKind::Quarantine,
                                Severity::Warning,
                                &format!("{} quarantined ({})", key, reason.as_str()),
                                json!(entry),
                            )
                            .await;
                        quarantined.push(entry);
                        "quarantined"
                    }
                }
                Resolution::FetchFailed => {
                    let count = state.failed_attempts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    let count = *count;
                    let kind = done.fetch.error_kind();
                    let permanent = kind == Some(FetchErrorKind::PermanentClient)
                        || count >= self.config.max_item_failures.max(1);
                    if permanent {
                        let message = done
                            .fetch
                            .error
                            .as_ref()
                            .map(|e| e.message.clone())
                            .unwrap_or_default();
                        let entry = self
                            .give_up(&mut state, &mut failures, &done.item, kind, message, count)
                            .await;
                        metrics.permanently_failed();
                        failed.push(entry);
                        "failed"
                    } else {
                        debug!(item = %key, failures = count, "requeueing after fetch failure");
                        metrics.requeued();
                        queue.push_back(done.item.clone());
                        "requeued"
                    }
                }
                Resolution::Conflict(e) => {
                    warn!(item = %key, error = %e, "storage conflict");
                    metrics.storage_conflict();
                    let entry = self
                        .give_up(&mut state, &mut failures, &done.item, None, e.to_string(), 1)
                        .await;
                    metrics.permanently_failed();
                    failed.push(entry);
                    "failed"
                }
                Resolution::StorageFault(e) => {
                    error!(item = %key, error = %e, "local storage fault");
                    queue.push_front(done.item.clone());
                    fatal.get_or_insert(SchedulerError::Storage(e));
                    "aborted"
                }
            };

            let done_count = state.completed.len() + state.permanently_failed.len();
            let total = done_count + queue.len() + in_flight.len();
            progress.report(ProgressEvent::ItemResolved {
                item: key,
                outcome,
                done: done_count as u64,
                total: total as u64,
            });

            since_checkpoint += 1;
            let due = since_checkpoint >= self.config.checkpoint_every_items.max(1)
                || last_checkpoint.elapsed() >= self.config.checkpoint_interval();
            if due && fatal.is_none() {
                debug!(phase = Phase::Checkpointing.as_str(), "persisting progress");
                state.pending = queue.iter().chain(in_flight.iter()).cloned().collect();
                state.refresh_progress();
                state.last_checkpoint_at = Some(Utc::now());
                match checkpoints.save(&state).await {
                    Ok(()) => {
                        metrics.checkpoint();
                        progress.report(ProgressEvent::Checkpointed {
                            pending: state.pending.len() as u64,
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "checkpoint write failed");
                        fatal = Some(SchedulerError::Checkpoint(e));
                    }
                }
                state.pending.clear();
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }

        state.pending = queue.into_iter().chain(in_flight).collect();
        state.refresh_progress();
        state.last_checkpoint_at = Some(Utc::now());

        if let Err(e) = failures.save().await {
            error!(error = %e, "failure ledger write failed");
            fatal.get_or_insert(SchedulerError::Storage(e));
        }
        if let Err(e) = self.parts.content.flush().await {
            warn!(error = %e, "hash index snapshot not written");
        }

        if let Some(err) = fatal {
            if !matches!(err, SchedulerError::Checkpoint(_)) {
                if let Err(e) = checkpoints.save(&state).await {
                    error!(error = %e, "final checkpoint write failed");
                }
            }
            return Err(err);
        }

        let phase = if state.is_drained() {
            checkpoints.clear().await.map_err(SchedulerError::Checkpoint)?;
            Phase::Drained
        } else {
            checkpoints.save(&state).await.map_err(SchedulerError::Checkpoint)?;
            metrics.checkpoint();
            self.parts
                .notifier
                .notify(
                    NoticeKind::Suspended,
                    Severity::Info,
                    &format!(
                        "harvest suspended with {} items pending ({:.0}% done)",
                        state.pending.len(),
                        state.progress_fraction * 100.0
                    ),
                    json!({
                        "pending": state.pending.len(),
                        "completed": state.completed.len(),
                        "progress_fraction": state.progress_fraction,
                    }),
                )
                .await;
            Phase::Suspended
        };

        let done_count = (state.completed.len() + state.permanently_failed.len()) as u64;
        progress.report(ProgressEvent::Stopped {
            phase: phase.as_str(),
            done: done_count,
            total: state.total() as u64,
        });

        let report = RunReport {
            phase,
            resumed,
            invocations: state.invocations,
            started_at,
            finished_at: Utc::now(),
            metrics: metrics.snapshot(started.elapsed()),
            quarantined,
            failed,
            pending: state.pending.len(),
            progress_fraction: state.progress_fraction,
        };
        info!(
            phase = phase.as_str(),
            landed = report.metrics.landed,
            duplicates = report.metrics.duplicates,
            quarantined = report.metrics.quarantined,
            failed = report.metrics.permanently_failed,
            pending = report.pending,
            "harvest finished"
        );
        Ok(report)
    }

    async fn give_up(
        &self,
        state: &mut ExecutionState,
        failures: &mut FailureLedger,
        item: &WorkItem,
        kind: Option<FetchErrorKind>,
        message: String,
        count: u32,
    ) -> FailedItem {
        let entry = FailedItem {
            item: item.clone(),
            error_kind: kind,
            message,
            failures: count,
            failed_at: Utc::now(),
        };
        state.permanently_failed.insert(item.clone());
        failures.record(entry.clone());
        warn!(item = %item, failures = count, "item permanently failed");
        self.parts
            .notifier
            .notify(
                NoticeKind::PermanentFailure,
                Severity::Error,
                &format!("{} failed permanently: {}", item, entry.message),
                json!(entry),
            )
            .await;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QualityConfig, SizeLimit};
    use crate::content::StoreLayout;
    use crate::error::FetchError;
    use crate::models::{DataTypeSpec, PeriodKind, SourceParameters};
    use crate::progress::NoProgress;
    use crate::store::memory::MemoryObjectStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves a fixed payload per logical name, or a fixed error.
    struct FakeFetcher {
        payloads: Mutex<HashMap<String, Result<Vec<u8>, FetchErrorKind>>>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(delay: Duration) -> Self {
            Self {
                payloads: Mutex::new(HashMap::new()),
                delay,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn serve(&self, logical: &str, reply: Result<Vec<u8>, FetchErrorKind>) {
            self.payloads
                .lock()
                .unwrap()
                .insert(logical.to_string(), reply);
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
            self.calls.lock().unwrap().push(item.logical_name());
            tokio::time::sleep(self.delay).await;
            let reply = self
                .payloads
                .lock()
                .unwrap()
                .get(&item.logical_name())
                .cloned()
                .unwrap_or_else(|| Ok(table(item.period_key.index)));
            match reply {
                Ok(bytes) => FetchOutcome::succeeded(bytes, 1, self.delay),
                Err(kind) => FetchOutcome::failed(FetchError::new(kind, "scripted"), 4, self.delay),
            }
        }
    }

    fn table(seed: u32) -> Vec<u8> {
        let mut s = String::from("area,cases,rate\n");
        for i in 0..5 {
            s.push_str(&format!("r{},{},{}\n", i, 10 + seed, 1));
        }
        s.into_bytes()
    }

    fn spec() -> DataTypeSpec {
        DataTypeSpec {
            name: "sentinel_monthly_age".into(),
            period_kind: PeriodKind::Monthly,
            source: SourceParameters {
                report_type: "10".into(),
                endpoint: "dlmage.do".into(),
                pref_code: "13".into(),
                hc_code: "00".into(),
                epid_code: "00".into(),
                total_mode: "0".into(),
            },
            expected_columns: None,
        }
    }

    fn quality() -> QualityConfig {
        let mut cfg = QualityConfig::default();
        cfg.size_limits
            .insert("csv".into(), SizeLimit { min: 20, max: 4_096 });
        cfg.encoding = "utf-8".into();
        cfg.anomaly_detection_enabled = false;
        cfg
    }

    struct Harness {
        mem: Arc<MemoryObjectStore>,
        fetcher: Arc<FakeFetcher>,
        content: Arc<ContentStore>,
    }

    impl Harness {
        async fn new(delay: Duration) -> Self {
            let mem = Arc::new(MemoryObjectStore::new());
            let content = Arc::new(
                ContentStore::open(mem.clone(), StoreLayout::default(), "utf-8")
                    .await
                    .unwrap(),
            );
            Self {
                mem,
                fetcher: Arc::new(FakeFetcher::new(delay)),
                content,
            }
        }

        fn scheduler(&self, config: SchedulerConfig, incremental: bool) -> ExecutionScheduler {
            let parts = Collaborators {
                fetcher: self.fetcher.clone(),
                gate: Arc::new(QualityGate::new(quality())),
                content: self.content.clone(),
                state_store: self.mem.clone(),
                notifier: Arc::new(crate::notify::NullNotifier),
                progress: Arc::new(NoProgress),
            };
            let backlog = BacklogDefinition {
                data_types: vec![spec()],
                start_year: 2023,
                end_year: Some(2023),
                incremental,
                refresh_recent_periods: 0,
            };
            ExecutionScheduler::new(config, backlog, parts)
                .with_today(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_parallelism: 3,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_full_backlog() {
        let h = Harness::new(Duration::from_secs(1)).await;
        let report = h.scheduler(config(), true).run().await.unwrap();
        assert_eq!(report.phase, Phase::Drained);
        assert_eq!(report.metrics.landed, 12);
        assert_eq!(report.pending, 0);
        assert!(!h.mem.exists("state/checkpoint.json").await.unwrap());
        assert_eq!(h.content.current_records().await.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_drains() {
        let h = Harness::new(Duration::from_secs(1)).await;
        let config = SchedulerConfig {
            soft_budget_secs: f64::INFINITY,
            ..config()
        };
        let report = h.scheduler(config, true).run().await.unwrap();
        assert_eq!(report.phase, Phase::Drained);
        assert_eq!(report.metrics.landed, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_full_mode_lands_nothing() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.scheduler(config(), false).run().await.unwrap();
        let records = h.content.records().await.len();

        let report = h.scheduler(config(), false).run().await.unwrap();
        assert_eq!(report.metrics.landed, 0);
        assert_eq!(report.metrics.duplicates, 12);
        assert_eq!(h.content.records().await.len(), records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_client_error_fails_immediately() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.fetcher
            .serve("sentinel_monthly_age_2023_04", Err(FetchErrorKind::PermanentClient));
        let report = h.scheduler(config(), true).run().await.unwrap();
        assert_eq!(report.phase, Phase::Drained);
        assert_eq!(report.failed.len(), 1);
        assert!(report.has_permanent_failures());
        assert_eq!(report.metrics.landed, 11);

        // excluded from the next enumeration
        let (state, _) = h.scheduler(config(), true).plan().await.unwrap();
        assert!(state.pending.is_empty());
        let (state, _) = h
            .scheduler(config(), true)
            .with_retry_failed(true)
            .plan()
            .await
            .unwrap();
        assert_eq!(state.pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_requeue_until_limit() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.fetcher
            .serve("sentinel_monthly_age_2023_02", Err(FetchErrorKind::UpstreamServer));
        let report = h.scheduler(config(), true).run().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].failures, 3);
        assert_eq!(report.metrics.requeued, 2);
        let calls = h.fetcher.calls.lock().unwrap();
        assert_eq!(
            calls
                .iter()
                .filter(|c| *c == "sentinel_monthly_age_2023_02")
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_payload_refetched_once_then_quarantined() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.fetcher.serve("sentinel_monthly_age_2023_05", Ok(b"tiny".to_vec()));
        let report = h.scheduler(config(), true).run().await.unwrap();

        assert_eq!(report.phase, Phase::Drained);
        assert_eq!(report.metrics.quarantined, 1);
        assert_eq!(report.quarantined.len(), 2);
        assert!(report.quarantined[0].refetch);
        assert!(!report.quarantined[1].refetch);
        assert!(h
            .content
            .current_record("sentinel_monthly_age_2023_05")
            .await
            .is_none());
        assert_eq!(h.content.quarantine_notes().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revised_upstream_supersedes() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.scheduler(config(), false).run().await.unwrap();

        h.fetcher
            .serve("sentinel_monthly_age_2023_12", Ok(table(99)));
        let report = h.scheduler(config(), false).run().await.unwrap();
        assert_eq!(report.metrics.landed, 1);
        assert_eq!(report.metrics.superseded, 1);
        assert_eq!(h.content.records().await.len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revision_without_supersede_is_conflict() {
        let h = Harness::new(Duration::from_millis(10)).await;
        h.scheduler(config(), false).run().await.unwrap();

        h.fetcher
            .serve("sentinel_monthly_age_2023_12", Ok(table(99)));
        let cfg = SchedulerConfig {
            supersede_on_revision: false,
            ..config()
        };
        let report = h.scheduler(cfg, false).run().await.unwrap();
        assert_eq!(report.metrics.storage_conflicts, 1);
        assert_eq!(report.failed.len(), 1);
    }
}
