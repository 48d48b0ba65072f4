//! `harvest run` and `harvest status`.
//!
//! Wires the configured engine together (HTTPS transport, shared rate
//! limiter, quality gate, filesystem-backed content store, notifier) and
//! hands it to the core scheduler. Every completed run leaves a JSON run
//! report in the log directory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use survey_harvest_core::checkpoint::{CheckpointStore, FailureLedger};
use survey_harvest_core::content::ContentStore;
use survey_harvest_core::fetch::{FetchClient, Transport};
use survey_harvest_core::quality::QualityGate;
use survey_harvest_core::rate_limit::RateLimiter;
use survey_harvest_core::scheduler::{Collaborators, ExecutionScheduler, RunReport};
use survey_harvest_core::store::ObjectStore;

use crate::config::{check_budget_secs, Config};
use crate::fs_store::FsObjectStore;
use crate::notify::build_notifier;
use crate::progress::ProgressMode;
use crate::stats::format_duration_ms;
use crate::transport::HttpTransport;

/// Object store and content store over the configured storage root.
pub struct Storage {
    pub objects: Arc<dyn ObjectStore>,
    pub content: Arc<ContentStore>,
}

pub async fn open_storage(config: &Config) -> Result<Storage> {
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage.root));
    let content = ContentStore::open(
        objects.clone(),
        config.storage.layout(),
        config.quality.encoding.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "Failed to open content store at {}",
            config.storage.root.display()
        )
    })?;
    Ok(Storage {
        objects,
        content: Arc::new(content),
    })
}

/// The date that decides which periods are due.
pub fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Enumerate every cell instead of only the missing ones.
    pub full: bool,
    pub retry_failed: bool,
    /// Overrides `scheduler.soft_budget_secs`.
    pub budget_secs: Option<f64>,
    pub progress: ProgressMode,
    pub today: NaiveDate,
}

/// What a run hands back to the CLI.
pub enum RunOutcome {
    Planned { items: usize },
    Finished { report: RunReport, report_path: String },
}

impl RunOutcome {
    /// Runs with permanently failed items exit non-zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Finished { report, .. } if report.has_permanent_failures() => 1,
            _ => 0,
        }
    }
}

pub async fn run_harvest(config: &Config, opts: RunOptions) -> Result<RunOutcome> {
    let transport = Arc::new(HttpTransport::new(&config.upstream)?);
    run_with_transport(config, transport, opts).await
}

/// [`run_harvest`] over any transport.
pub async fn run_with_transport(
    config: &Config,
    transport: Arc<dyn Transport>,
    opts: RunOptions,
) -> Result<RunOutcome> {
    let storage = open_storage(config).await?;

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let fetcher = FetchClient::new(
        transport,
        limiter,
        config.retry.clone(),
        Duration::from_secs(config.upstream.request_timeout_secs),
    );
    let notifier = build_notifier(&config.notifications, storage.objects.clone());

    let mut scheduler_config = config.scheduler.clone();
    if let Some(budget) = opts.budget_secs {
        check_budget_secs(budget).context("Invalid --budget-secs")?;
        scheduler_config.soft_budget_secs = budget;
    }
    let mut backlog = config.backlog()?;
    if opts.full {
        backlog.incremental = false;
    }

    let parts = Collaborators {
        fetcher: Arc::new(fetcher),
        gate: Arc::new(QualityGate::new(config.quality()?)),
        content: storage.content.clone(),
        state_store: storage.objects.clone(),
        notifier: notifier.clone(),
        progress: Arc::from(opts.progress.reporter()),
    };
    let scheduler = ExecutionScheduler::new(scheduler_config, backlog, parts)
        .with_state_paths(
            config.storage.checkpoint_path(),
            config.storage.failures_path(),
        )
        .with_retry_failed(opts.retry_failed || config.collection.retry_failed)
        .with_today(opts.today);

    if opts.dry_run {
        let (state, resumed) = scheduler.plan().await?;
        print_plan(&state.pending, resumed);
        return Ok(RunOutcome::Planned {
            items: state.pending.len(),
        });
    }

    let report = scheduler.run().await?;
    notifier.finish().await;

    let report_path = write_run_report(storage.objects.as_ref(), &config.storage.log_dir, &report).await?;
    print_report(&report, &report_path);
    Ok(RunOutcome::Finished {
        report,
        report_path,
    })
}

fn print_plan(items: &[survey_harvest_core::models::WorkItem], resumed: bool) {
    println!("harvest (dry-run)");
    println!(
        "  items due: {}{}",
        items.len(),
        if resumed { " (from checkpoint)" } else { "" }
    );
    let mut by_type: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for item in items {
        by_type
            .entry(item.data_type.as_str())
            .or_default()
            .push(item.period_key.to_string());
    }
    for (data_type, keys) in &by_type {
        let first = keys.first().map(String::as_str).unwrap_or("-");
        let last = keys.last().map(String::as_str).unwrap_or("-");
        println!(
            "  {:<36} {:>6}   {} .. {}",
            data_type,
            keys.len(),
            first,
            last
        );
    }
}

fn print_report(report: &RunReport, report_path: &str) {
    let m = &report.metrics;
    println!("harvest {}", report.phase.as_str());
    println!(
        "  enumerated: {}{}",
        m.enumerated,
        if report.resumed { " (resumed)" } else { "" }
    );
    println!(
        "  landed: {} ({} aliased, {} superseded, {} bytes)",
        m.landed, m.aliased, m.superseded, m.bytes_landed
    );
    println!("  unchanged: {}", m.duplicates);
    println!("  quarantined: {}", m.quarantined);
    println!("  requeued: {}", m.requeued);
    println!("  permanently failed: {}", m.permanently_failed);
    println!("  pending: {}", report.pending);
    println!("  progress: {:.1}%", report.progress_fraction * 100.0);
    println!(
        "  fetches: {} in {} attempts, mean {}",
        m.fetched,
        m.fetch_attempts,
        m.mean_fetch_ms()
            .map(|ms| format_duration_ms(ms as u64))
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  elapsed: {}", format_duration_ms(m.elapsed_ms));
    println!("  report: {}", report_path);
    for failed in &report.failed {
        println!("  failed: {}  {}", failed.item, failed.message);
    }
    println!("ok");
}

#[derive(Serialize)]
struct RunReportFile<'a> {
    run_id: String,
    #[serde(flatten)]
    report: &'a RunReport,
}

/// Persist the run report as `{log_dir}/run_{timestamp}_{id}.json`.
pub async fn write_run_report(
    store: &dyn ObjectStore,
    log_dir: &str,
    report: &RunReport,
) -> Result<String> {
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let path = format!(
        "{}/run_{}_{}.json",
        log_dir,
        report.finished_at.format("%Y%m%dT%H%M%SZ"),
        &run_id[..8]
    );
    let json = serde_json::to_vec_pretty(&RunReportFile { run_id, report })?;
    store
        .write_bytes(&path, &json)
        .await
        .with_context(|| format!("Failed to write run report {}", path))?;
    info!(path = %path, "run report written");
    Ok(path)
}

/// `harvest status`: the suspended run, if any, and the failure ledger.
pub async fn run_status(config: &Config) -> Result<()> {
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage.root));
    let checkpoints = CheckpointStore::new(objects.clone(), config.storage.checkpoint_path());
    let failures = FailureLedger::open(objects, config.storage.failures_path()).await?;

    println!("Survey Harvest — Status");
    println!("=======================");
    println!();
    match checkpoints.load().await? {
        Some(state) => {
            println!("  Suspended run:   yes");
            println!("  Started:         {}", state.started_at.format("%Y-%m-%d %H:%M UTC"));
            if let Some(at) = state.last_checkpoint_at {
                println!("  Last checkpoint: {}", at.format("%Y-%m-%d %H:%M UTC"));
            }
            println!("  Invocations:     {}", state.invocations);
            println!("  Pending:         {}", state.pending.len());
            println!("  Completed:       {}", state.completed.len());
            println!("  Failed:          {}", state.permanently_failed.len());
            println!("  Progress:        {:.1}%", state.progress_fraction * 100.0);
            if let Some(next) = state.pending.first() {
                println!("  Next item:       {}", next);
            }
        }
        None => println!("  Suspended run:   none"),
    }

    println!();
    println!("  Permanently failed items: {}", failures.len());
    for entry in failures.entries() {
        println!(
            "    {:<44} {:>2}x  {}  {}",
            entry.item.key(),
            entry.failures,
            entry.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            entry.failed_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}
