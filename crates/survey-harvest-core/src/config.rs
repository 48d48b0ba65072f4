//! Component configuration.
//!
//! Each engine component takes its own immutable section at construction.
//! All sections deserialize from TOML with defaults for every field, so
//! the application config can embed them directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Attempt-level retry policy for the fetch client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Extra multiplier applied to the backoff of throttled attempts.
    pub rate_limited_factor: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            rate_limited_factor: 2.0,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Pacing for the shared request gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Floor of the inter-request interval.
    pub min_interval_ms: u64,
    /// Ceiling the interval may widen to under congestion.
    pub max_interval_ms: u64,
    pub congestion_factor: f64,
    /// Consecutive clean responses before the interval decays.
    pub decay_after: u32,
    pub decay_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_500,
            max_interval_ms: 30_000,
            congestion_factor: 2.0,
            decay_after: 5,
            decay_factor: 0.75,
        }
    }
}

/// Inclusive byte-size bounds for one payload category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeLimit {
    pub min: u64,
    pub max: u64,
}

/// Validation and anomaly-detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Keyed by data type name, falling back to the `"csv"` entry.
    pub size_limits: BTreeMap<String, SizeLimit>,
    /// WHATWG encoding label of the upstream tables.
    pub encoding: String,
    pub min_rows: u64,
    pub max_rows: u64,
    pub min_columns: usize,
    pub max_columns: usize,
    /// Data table width per data type; a different width is an error.
    pub expected_columns: BTreeMap<String, usize>,
    pub anomaly_detection_enabled: bool,
    /// Relative deviation from the baseline mean that routes a payload
    /// to quarantine.
    pub anomaly_threshold: f64,
    /// Standard deviations a metric must move before it counts at all.
    pub anomaly_z_threshold: f64,
    pub baseline_window: usize,
    pub min_baseline_samples: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let mut size_limits = BTreeMap::new();
        size_limits.insert(
            "csv".to_string(),
            SizeLimit {
                min: 100,
                max: 10 * 1024 * 1024,
            },
        );
        Self {
            size_limits,
            encoding: "shift_jis".to_string(),
            min_rows: 1,
            max_rows: 1_000_000,
            min_columns: 2,
            max_columns: 100,
            expected_columns: BTreeMap::new(),
            anomaly_detection_enabled: true,
            anomaly_threshold: 0.3,
            anomaly_z_threshold: 3.0,
            baseline_window: 8,
            min_baseline_samples: 3,
        }
    }
}

impl QualityConfig {
    pub fn size_limit_for(&self, data_type: &str) -> Option<SizeLimit> {
        self.size_limits
            .get(data_type)
            .or_else(|| self.size_limits.get("csv"))
            .copied()
    }
}

/// Execution settings for the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_parallelism: usize,
    /// Wall-clock budget after which no new items are dispatched.
    pub soft_budget_secs: f64,
    pub checkpoint_every_items: usize,
    pub checkpoint_interval_secs: u64,
    /// Item-level failures (each a full attempt sequence) before an item
    /// is given up on.
    pub max_item_failures: u32,
    pub refetch_on_validation_failure: bool,
    pub refetch_on_anomaly: bool,
    /// Replace a landed file whose upstream content changed instead of
    /// failing the item with a storage conflict.
    pub supersede_on_revision: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            soft_budget_secs: 5.5 * 3600.0,
            checkpoint_every_items: 10,
            checkpoint_interval_secs: 60,
            max_item_failures: 3,
            refetch_on_validation_failure: true,
            refetch_on_anomaly: false,
            supersede_on_revision: true,
        }
    }
}

impl SchedulerConfig {
    /// Negative and NaN budgets are zero; budgets too large for a
    /// `Duration` saturate.
    pub fn soft_budget(&self) -> Duration {
        if self.soft_budget_secs.is_nan() || self.soft_budget_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.soft_budget_secs).unwrap_or(Duration::MAX)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
