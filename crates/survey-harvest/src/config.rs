//! Configuration loading and validation.
//!
//! Survey Harvest is configured via a TOML file (default: `config/harvest.toml`).
//! Every section except `[storage]` has defaults; engine sections (`[retry]`,
//! `[rate_limit]`, `[quality]`, `[scheduler]`) deserialize straight into the
//! core crate's component configs.
//!
//! # Example
//!
//! ```toml
//! [storage]
//! root = "./data"
//!
//! [collection]
//! start_year = 2020
//! data_types = ["sentinel_weekly_age", "notifiable_weekly"]
//!
//! [scheduler]
//! max_parallelism = 2
//! soft_budget_secs = 19800
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Datelike;
use serde::Deserialize;
use tracing::warn;

use survey_harvest_core::backlog::BacklogDefinition;
use survey_harvest_core::config::{
    QualityConfig, RateLimitConfig, RetryPolicy, SchedulerConfig,
};
use survey_harvest_core::content::StoreLayout;
use survey_harvest_core::models::{DataTypeSpec, PeriodKind, SourceParameters};
use survey_harvest_core::store::check_path;

pub const DEFAULT_BASE_URL: &str = "https://survey.tmiph.metro.tokyo.lg.jp/epidinfo";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// Overrides of, or additions to, the built-in catalogue.
    #[serde(default)]
    pub data_types: Vec<DataTypeOverride>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pref_code")]
    pub pref_code: String,
    #[serde(default = "default_hc_code")]
    pub hc_code: String,
    #[serde(default = "default_total_mode")]
    pub total_mode: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            pref_code: default_pref_code(),
            hc_code: default_hc_code(),
            total_mode: default_total_mode(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_user_agent() -> String {
    format!("survey-harvest/{}", env!("CARGO_PKG_VERSION"))
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_pref_code() -> String {
    "13".to_string()
}
fn default_hc_code() -> String {
    "00".to_string()
}
fn default_total_mode() -> String {
    "0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    /// Defaults to the current year.
    #[serde(default)]
    pub end_year: Option<i32>,
    /// Names of the data types to collect, in collection order.
    #[serde(default = "default_collect")]
    pub data_types: Vec<String>,
    #[serde(default = "default_true")]
    pub incremental: bool,
    #[serde(default = "default_refresh_recent")]
    pub refresh_recent_periods: usize,
    /// Put permanently failed items back into the backlog.
    #[serde(default)]
    pub retry_failed: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            start_year: default_start_year(),
            end_year: None,
            data_types: default_collect(),
            incremental: true,
            refresh_recent_periods: default_refresh_recent(),
            retry_failed: false,
        }
    }
}

fn default_start_year() -> i32 {
    2000
}
fn default_collect() -> Vec<String> {
    CATALOGUE.iter().map(|e| e.name.to_string()).collect()
}
fn default_refresh_recent() -> usize {
    2
}
fn default_true() -> bool {
    true
}

/// Where everything lives. All directories are relative to `root`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: String,
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_data_dir() -> String {
    "raw".to_string()
}
fn default_quarantine_dir() -> String {
    "quarantine".to_string()
}
fn default_metadata_dir() -> String {
    "raw/.metadata".to_string()
}
fn default_state_dir() -> String {
    "state".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}

impl StorageConfig {
    pub fn layout(&self) -> StoreLayout {
        StoreLayout {
            data_dir: self.data_dir.clone(),
            quarantine_dir: self.quarantine_dir.clone(),
            metadata_dir: self.metadata_dir.clone(),
        }
    }

    pub fn checkpoint_path(&self) -> String {
        format!("{}/checkpoint.json", self.state_dir)
    }

    pub fn failures_path(&self) -> String {
        format!("{}/failed_items.json", self.state_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_anomaly: bool,
    #[serde(default = "default_true")]
    pub on_suspend: bool,
    #[serde(default = "default_max_per_run")]
    pub max_per_run: usize,
    /// JSONL file, relative to the storage root, that receives notices.
    #[serde(default = "default_outbox")]
    pub outbox: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_failure: true,
            on_anomaly: true,
            on_suspend: true,
            max_per_run: default_max_per_run(),
            outbox: default_outbox(),
        }
    }
}

fn default_max_per_run() -> usize {
    10
}
fn default_outbox() -> String {
    "logs/notifications.jsonl".to_string()
}

/// A `[[data_types]]` entry. Fields left out keep the catalogue value; a
/// name outside the catalogue must give `period`, `report_type` and
/// `endpoint`.
#[derive(Debug, Deserialize, Clone)]
pub struct DataTypeOverride {
    pub name: String,
    #[serde(default)]
    pub period: Option<PeriodKind>,
    #[serde(default)]
    pub report_type: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub epid_code: Option<String>,
    #[serde(default)]
    pub expected_columns: Option<usize>,
}

struct CatalogueEntry {
    name: &'static str,
    period: PeriodKind,
    report_type: &'static str,
    endpoint: &'static str,
    epid_code: &'static str,
}

/// The Tokyo surveillance tables.
const CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry {
        name: "sentinel_weekly_gender",
        period: PeriodKind::Weekly,
        report_type: "1",
        endpoint: "dlwgender.do",
        epid_code: "00",
    },
    CatalogueEntry {
        name: "sentinel_weekly_age",
        period: PeriodKind::Weekly,
        report_type: "0",
        endpoint: "dlwage.do",
        epid_code: "00",
    },
    CatalogueEntry {
        name: "sentinel_weekly_health_center",
        period: PeriodKind::Weekly,
        report_type: "2",
        endpoint: "dlwhc.do",
        epid_code: "",
    },
    CatalogueEntry {
        name: "sentinel_weekly_medical_district",
        period: PeriodKind::Weekly,
        report_type: "5",
        endpoint: "dlwzone.do",
        epid_code: "",
    },
    CatalogueEntry {
        name: "sentinel_monthly_gender",
        period: PeriodKind::Monthly,
        report_type: "15",
        endpoint: "dlmgender.do",
        epid_code: "00",
    },
    CatalogueEntry {
        name: "sentinel_monthly_age",
        period: PeriodKind::Monthly,
        report_type: "10",
        endpoint: "dlmage.do",
        epid_code: "00",
    },
    CatalogueEntry {
        name: "sentinel_monthly_health_center",
        period: PeriodKind::Monthly,
        report_type: "11",
        endpoint: "dlmhc.do",
        epid_code: "",
    },
    CatalogueEntry {
        name: "sentinel_monthly_medical_district",
        period: PeriodKind::Monthly,
        report_type: "12",
        endpoint: "dlmzone.do",
        epid_code: "",
    },
    CatalogueEntry {
        name: "notifiable_weekly",
        period: PeriodKind::Weekly,
        report_type: "20",
        endpoint: "dlwzensu.do",
        epid_code: "",
    },
];

impl Config {
    /// Every known data type: the catalogue with `[[data_types]]` applied.
    pub fn catalogue(&self) -> Result<Vec<DataTypeSpec>> {
        let mut specs: Vec<DataTypeSpec> = CATALOGUE
            .iter()
            .map(|e| DataTypeSpec {
                name: e.name.to_string(),
                period_kind: e.period,
                source: SourceParameters {
                    report_type: e.report_type.to_string(),
                    endpoint: e.endpoint.to_string(),
                    pref_code: self.upstream.pref_code.clone(),
                    hc_code: self.upstream.hc_code.clone(),
                    epid_code: e.epid_code.to_string(),
                    total_mode: self.upstream.total_mode.clone(),
                },
                expected_columns: None,
            })
            .collect();

        for o in &self.data_types {
            match specs.iter_mut().find(|s| s.name == o.name) {
                Some(spec) => {
                    if let Some(period) = o.period {
                        spec.period_kind = period;
                    }
                    if let Some(rt) = &o.report_type {
                        spec.source.report_type = rt.clone();
                    }
                    if let Some(ep) = &o.endpoint {
                        spec.source.endpoint = ep.clone();
                    }
                    if let Some(code) = &o.epid_code {
                        spec.source.epid_code = code.clone();
                    }
                    if o.expected_columns.is_some() {
                        spec.expected_columns = o.expected_columns;
                    }
                }
                None => {
                    let (Some(period), Some(report_type), Some(endpoint)) =
                        (o.period, o.report_type.clone(), o.endpoint.clone())
                    else {
                        bail!(
                            "data_types '{}' is not built in; period, report_type and endpoint are required",
                            o.name
                        );
                    };
                    specs.push(DataTypeSpec {
                        name: o.name.clone(),
                        period_kind: period,
                        source: SourceParameters {
                            report_type,
                            endpoint,
                            pref_code: self.upstream.pref_code.clone(),
                            hc_code: self.upstream.hc_code.clone(),
                            epid_code: o.epid_code.clone().unwrap_or_else(|| "00".to_string()),
                            total_mode: self.upstream.total_mode.clone(),
                        },
                        expected_columns: o.expected_columns,
                    });
                }
            }
        }
        Ok(specs)
    }

    /// The data types named in `[collection]`, in that order.
    pub fn selected_data_types(&self) -> Result<Vec<DataTypeSpec>> {
        let catalogue = self.catalogue()?;
        self.collection
            .data_types
            .iter()
            .map(|name| {
                catalogue
                    .iter()
                    .find(|s| &s.name == name)
                    .cloned()
                    .with_context(|| format!("Unknown data type in collection.data_types: '{}'", name))
            })
            .collect()
    }

    pub fn backlog(&self) -> Result<BacklogDefinition> {
        Ok(BacklogDefinition {
            data_types: self.selected_data_types()?,
            start_year: self.collection.start_year,
            end_year: self.collection.end_year,
            incremental: self.collection.incremental,
            refresh_recent_periods: self.collection.refresh_recent_periods,
        })
    }

    /// Quality settings with catalogue column widths folded in. Explicit
    /// `[quality.expected_columns]` entries win.
    pub fn quality(&self) -> Result<QualityConfig> {
        let mut quality = self.quality.clone();
        for spec in self.catalogue()? {
            if let Some(width) = spec.expected_columns {
                quality.expected_columns.entry(spec.name).or_insert(width);
            }
        }
        Ok(quality)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// A time budget must be a finite number of seconds above zero.
pub fn check_budget_secs(secs: f64) -> Result<()> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("time budget must be a finite number of seconds > 0, got {}", secs);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    // Upstream
    if !config.upstream.base_url.starts_with("https://") {
        bail!(
            "upstream.base_url must use https: '{}'",
            config.upstream.base_url
        );
    }
    if config.upstream.request_timeout_secs == 0 {
        bail!("upstream.request_timeout_secs must be > 0");
    }

    // Retry and pacing
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }
    if config.retry.rate_limited_factor < 1.0 {
        bail!("retry.rate_limited_factor must be >= 1.0");
    }
    let rl = &config.rate_limit;
    if rl.min_interval_ms > rl.max_interval_ms {
        bail!("rate_limit.min_interval_ms must not exceed rate_limit.max_interval_ms");
    }
    if rl.congestion_factor < 1.0 {
        bail!("rate_limit.congestion_factor must be >= 1.0");
    }
    if !(0.0..=1.0).contains(&rl.decay_factor) || rl.decay_factor == 0.0 {
        bail!("rate_limit.decay_factor must be in (0.0, 1.0]");
    }

    // Quality
    let q = &config.quality;
    for (category, limit) in &q.size_limits {
        if limit.min >= limit.max {
            bail!("Invalid quality.size_limits for '{}': min must be < max", category);
        }
    }
    if q.size_limit_for("csv").is_none() {
        bail!("quality.size_limits must define a 'csv' entry");
    }
    if q.min_rows > q.max_rows {
        bail!("quality.min_rows must not exceed quality.max_rows");
    }
    if q.min_columns == 0 || q.min_columns > q.max_columns {
        bail!("quality.min_columns must be in [1, max_columns]");
    }
    if q.anomaly_threshold <= 0.0 {
        bail!("quality.anomaly_threshold must be > 0");
    }
    if q.baseline_window == 0 || q.min_baseline_samples == 0 {
        bail!("quality.baseline_window and quality.min_baseline_samples must be > 0");
    }
    if encoding_label_unknown(&q.encoding) {
        bail!("Unknown quality.encoding: '{}'", q.encoding);
    }

    // Scheduler
    let s = &config.scheduler;
    if s.max_parallelism == 0 {
        bail!("scheduler.max_parallelism must be >= 1");
    }
    check_budget_secs(s.soft_budget_secs).context("Invalid scheduler.soft_budget_secs")?;
    if s.max_item_failures == 0 {
        bail!("scheduler.max_item_failures must be >= 1");
    }
    if s.checkpoint_every_items == 0 {
        bail!("scheduler.checkpoint_every_items must be >= 1");
    }

    // Collection
    let c = &config.collection;
    if c.data_types.is_empty() {
        bail!("At least one data type must be listed in collection.data_types");
    }
    let mut seen = BTreeSet::new();
    for name in &c.data_types {
        if !seen.insert(name) {
            bail!("collection.data_types lists '{}' twice", name);
        }
    }
    config.selected_data_types()?;
    if c.start_year < 2000 {
        warn!(start_year = c.start_year, "start year is before 2000, data may not be available");
    }
    if let Some(end) = c.end_year {
        if end < c.start_year {
            bail!("collection.end_year must not precede collection.start_year");
        }
        if end > chrono::Local::now().year() {
            warn!(end_year = end, "end year is in the future");
        }
    }

    // Storage
    let st = &config.storage;
    for (field, dir) in [
        ("data_dir", &st.data_dir),
        ("quarantine_dir", &st.quarantine_dir),
        ("metadata_dir", &st.metadata_dir),
        ("state_dir", &st.state_dir),
        ("log_dir", &st.log_dir),
    ] {
        if check_path(dir).is_err() {
            bail!("storage.{} must be a relative path without '..': '{}'", field, dir);
        }
    }
    if check_path(&config.notifications.outbox).is_err() {
        bail!(
            "notifications.outbox must be a relative path without '..': '{}'",
            config.notifications.outbox
        );
    }

    // Notifications
    if config.notifications.max_per_run < 1 {
        bail!("notifications.max_per_run must be >= 1");
    }

    Ok(())
}

fn encoding_label_unknown(label: &str) -> bool {
    survey_harvest_core::tabular::decode(b"", label).is_err()
}
