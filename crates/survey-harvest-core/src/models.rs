//! Core data models used throughout the harvest pipeline.
//!
//! A [`WorkItem`] names one fetchable table (data type + period). Fetching
//! it produces a [`FetchOutcome`]; validating the payload produces a
//! [`QualityVerdict`]; landing it produces a [`FileRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{FetchError, FetchErrorKind};

/// Publication cadence of a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Weekly,
    Monthly,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Weekly => "weekly",
            PeriodKind::Monthly => "monthly",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A period within a year: ISO week number for weekly data, month for
/// monthly data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    pub year: i32,
    pub index: u32,
}

impl PeriodKey {
    pub fn new(year: i32, index: u32) -> Self {
        Self { year, index }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.index)
    }
}

/// Upstream query parameters for one data type.
///
/// `report_type` and `endpoint` identify the table; the remaining codes
/// narrow it (prefecture, health center, disease, aggregation mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceParameters {
    pub report_type: String,
    pub endpoint: String,
    pub pref_code: String,
    pub hc_code: String,
    pub epid_code: String,
    pub total_mode: String,
}

/// Static description of a collectable data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTypeSpec {
    pub name: String,
    pub period_kind: PeriodKind,
    pub source: SourceParameters,
    /// Column count of the data table, when known. Used by the quality gate.
    pub expected_columns: Option<usize>,
}

impl DataTypeSpec {
    pub fn work_item(&self, period_key: PeriodKey) -> WorkItem {
        WorkItem {
            data_type: self.name.clone(),
            period_kind: self.period_kind,
            period_key,
            source: self.source.clone(),
        }
    }
}

/// One fetchable unit of backlog work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub data_type: String,
    pub period_kind: PeriodKind,
    pub period_key: PeriodKey,
    pub source: SourceParameters,
}

impl WorkItem {
    /// Stable identifier used as a map key in checkpoints and ledgers.
    pub fn key(&self) -> String {
        format!("{}/{}", self.data_type, self.period_key)
    }

    /// Name of the landed file, without extension.
    pub fn logical_name(&self) -> String {
        format!(
            "{}_{}_{:02}",
            self.data_type, self.period_key.year, self.period_key.index
        )
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Result of one attempt sequence for a [`WorkItem`].
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub success: bool,
    pub payload: Option<Vec<u8>>,
    pub error: Option<FetchError>,
    pub attempt_count: u32,
    pub elapsed: Duration,
}

impl FetchOutcome {
    pub fn succeeded(payload: Vec<u8>, attempt_count: u32, elapsed: Duration) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            attempt_count,
            elapsed,
        }
    }

    pub fn failed(error: FetchError, attempt_count: u32, elapsed: Duration) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error),
            attempt_count,
            elapsed,
        }
    }

    pub fn error_kind(&self) -> Option<FetchErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Scalar summary of a decoded table, used for anomaly baselines.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadStats {
    pub row_count: u64,
    pub column_count: u32,
    /// Sum of every numeric cell in the table.
    pub numeric_total: f64,
}

/// Output of the quality gate for one payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub accepted: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub anomaly_score: f64,
    pub stats: Option<PayloadStats>,
}

impl QualityVerdict {
    /// Score in `[0, 1]` recorded on landed files: 1.0 for a clean
    /// payload, reduced by warnings and by statistical deviation.
    pub fn quality_score(&self) -> f64 {
        if !self.accepted {
            return 0.0;
        }
        let deviation_penalty = 1.0 - self.anomaly_score.clamp(0.0, 1.0);
        deviation_penalty * 0.9f64.powi(self.warnings.len() as i32)
    }
}

/// Lifecycle of a [`FileRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordStatus {
    Current,
    /// Replaced by a newer landing of the same logical name.
    Superseded {
        by_hash: String,
        at: DateTime<Utc>,
    },
    /// Post-hoc verification found the stored bytes do not match the hash.
    Corrupt { detected_at: DateTime<Utc> },
}

/// Persisted metadata for one landed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub logical_name: String,
    pub data_type: String,
    pub period_kind: PeriodKind,
    pub period_key: PeriodKey,
    pub retrieved_at: DateTime<Utc>,
    pub byte_size: u64,
    pub content_hash: String,
    pub encoding: String,
    pub source: SourceParameters,
    pub quality_score: f64,
    #[serde(default)]
    pub stats: Option<PayloadStats>,
    /// Object path holding the payload bytes. Several records may share a
    /// path when upstream served identical bytes for different periods.
    pub path: String,
    pub status: RecordStatus,
}

impl FileRecord {
    pub fn is_current(&self) -> bool {
        matches!(self.status, RecordStatus::Current)
    }
}
