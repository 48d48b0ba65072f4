//! Payload validation and anomaly screening.
//!
//! Structural validity (size, encoding, shape) decides `accepted`. The
//! statistical check only ever adds warnings and an anomaly score, and
//! [`route`] turns a high score into a quarantine decision.

use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::models::{PayloadStats, QualityVerdict, WorkItem};
use crate::tabular;

/// Summaries of prior accepted payloads for one (data type, period kind).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalBaseline {
    pub samples: Vec<PayloadStats>,
}

impl HistoricalBaseline {
    pub fn new(samples: Vec<PayloadStats>) -> Self {
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Why a payload was sent to quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    Rejected,
    Anomalous,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::Rejected => "rejected",
            QuarantineReason::Anomalous => "anomalous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Land,
    Quarantine(QuarantineReason),
}

pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn evaluate(
        &self,
        payload: &[u8],
        item: &WorkItem,
        baseline: &HistoricalBaseline,
    ) -> QualityVerdict {
        let mut verdict = QualityVerdict {
            accepted: false,
            ..QualityVerdict::default()
        };
        let cfg = &self.config;
        let size = payload.len() as u64;

        if let Some(limit) = cfg.size_limit_for(&item.data_type) {
            if size < limit.min {
                verdict
                    .errors
                    .push(format!("payload too small: {} bytes (minimum {})", size, limit.min));
            } else if size > limit.max {
                verdict
                    .errors
                    .push(format!("payload too large: {} bytes (maximum {})", size, limit.max));
            } else if size.saturating_mul(5) > limit.max.saturating_mul(4) {
                verdict.warnings.push(format!(
                    "payload size {} bytes is within 20% of the {} byte limit",
                    size, limit.max
                ));
            }
        }
        if !verdict.errors.is_empty() {
            return verdict;
        }

        let text = match tabular::decode(payload, &cfg.encoding) {
            Ok(text) => text,
            Err(e) => {
                verdict.errors.push(e.to_string());
                return verdict;
            }
        };

        let rows = tabular::parse_rows(&text);
        let shape = tabular::shape(&rows);

        if shape.rows < cfg.min_rows {
            verdict
                .errors
                .push(format!("too few rows: {} (minimum {})", shape.rows, cfg.min_rows));
        } else if shape.rows > cfg.max_rows {
            verdict
                .errors
                .push(format!("too many rows: {} (maximum {})", shape.rows, cfg.max_rows));
        }
        if shape.max_columns < cfg.min_columns {
            verdict.errors.push(format!(
                "too few columns: {} (minimum {})",
                shape.max_columns, cfg.min_columns
            ));
        } else if shape.max_columns > cfg.max_columns {
            verdict.errors.push(format!(
                "too many columns: {} (maximum {})",
                shape.max_columns, cfg.max_columns
            ));
        }
        if let Some(&expected) = cfg.expected_columns.get(&item.data_type) {
            if shape.max_columns != expected {
                verdict.errors.push(format!(
                    "column count mismatch: {} (expected {})",
                    shape.max_columns, expected
                ));
            }
        }
        if !shape.is_consistent() {
            verdict
                .warnings
                .push(format!("inconsistent column count: {:?}", shape.widths));
        }

        let stats = tabular::summarize(&rows);
        verdict.stats = Some(stats);
        if !verdict.errors.is_empty() {
            return verdict;
        }
        verdict.accepted = true;

        if cfg.anomaly_detection_enabled {
            if let Some((metric, score)) = self.anomaly(&stats, baseline) {
                verdict.anomaly_score = score;
                if score > cfg.anomaly_threshold {
                    verdict.warnings.push(format!(
                        "{} deviates {:.0}% from the recent baseline",
                        metric,
                        score * 100.0
                    ));
                }
            }
        }
        verdict
    }

    /// Largest relative deviation among metrics that also clear the
    /// z-score bar. `None` when the baseline is too short to judge.
    fn anomaly(
        &self,
        current: &PayloadStats,
        baseline: &HistoricalBaseline,
    ) -> Option<(&'static str, f64)> {
        let window = self.config.baseline_window.max(1);
        let start = baseline.samples.len().saturating_sub(window);
        let recent = &baseline.samples[start..];
        if recent.len() < self.config.min_baseline_samples.max(1) {
            return None;
        }

        let metrics: [(&'static str, fn(&PayloadStats) -> f64); 2] = [
            ("row count", |s: &PayloadStats| s.row_count as f64),
            ("numeric total", |s: &PayloadStats| s.numeric_total),
        ];

        let mut worst: Option<(&'static str, f64)> = None;
        for (name, get) in metrics {
            let history: Vec<f64> = recent.iter().map(get).collect();
            let score = deviation(get(current), &history, self.config.anomaly_z_threshold);
            if worst.map_or(true, |(_, w)| score > w) {
                worst = Some((name, score));
            }
        }
        worst
    }
}

/// Relative deviation of `x` from the mean of `history`, or zero when `x`
/// sits within `z_threshold` standard deviations.
fn deviation(x: f64, history: &[f64], z_threshold: f64) -> f64 {
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let var = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    let diff = (x - mean).abs();
    if diff == 0.0 {
        return 0.0;
    }
    let z = if std > 0.0 { diff / std } else { f64::INFINITY };
    if z <= z_threshold {
        return 0.0;
    }
    diff / mean.abs().max(1.0)
}

/// Two-tier routing: rejected payloads and accepted-but-anomalous ones go
/// to quarantine, the rest land.
pub fn route(verdict: &QualityVerdict, config: &QualityConfig) -> GateDecision {
    if !verdict.accepted {
        return GateDecision::Quarantine(QuarantineReason::Rejected);
    }
    if config.anomaly_detection_enabled
        && !verdict.warnings.is_empty()
        && verdict.anomaly_score > config.anomaly_threshold
    {
        return GateDecision::Quarantine(QuarantineReason::Anomalous);
    }
    GateDecision::Land
}
