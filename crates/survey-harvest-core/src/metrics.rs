//! Run metrics: counts, bytes, fetch timings and error tallies.
//!
//! Pure aggregation. The scheduler feeds one [`MetricsRecorder`] from its
//! driver loop and snapshots it into the run report.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchErrorKind;
use crate::models::FetchOutcome;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub enumerated: u64,
    pub fetched: u64,
    pub landed: u64,
    /// Landed by pointing at identical bytes already stored.
    pub aliased: u64,
    pub superseded: u64,
    pub duplicates: u64,
    pub quarantined: u64,
    pub requeued: u64,
    pub permanently_failed: u64,
    pub storage_conflicts: u64,
    pub bytes_landed: u64,
    pub fetch_attempts: u64,
    pub fetch_time_ms: u64,
    pub slowest_fetch_ms: u64,
    pub errors_by_kind: BTreeMap<FetchErrorKind, u64>,
    pub checkpoints: u64,
    pub elapsed_ms: u64,
}

impl RunMetrics {
    pub fn mean_fetch_ms(&self) -> Option<f64> {
        if self.fetched == 0 {
            None
        } else {
            Some(self.fetch_time_ms as f64 / self.fetched as f64)
        }
    }

    /// Items that reached a terminal resolution.
    pub fn resolved(&self) -> u64 {
        self.landed + self.duplicates + self.quarantined + self.permanently_failed
    }
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    metrics: RunMetrics,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enumerated(&mut self, n: usize) {
        self.metrics.enumerated = n as u64;
    }

    pub fn fetch(&mut self, outcome: &FetchOutcome) {
        let ms = outcome.elapsed.as_millis() as u64;
        self.metrics.fetched += 1;
        self.metrics.fetch_attempts += outcome.attempt_count as u64;
        self.metrics.fetch_time_ms += ms;
        self.metrics.slowest_fetch_ms = self.metrics.slowest_fetch_ms.max(ms);
        if let Some(kind) = outcome.error_kind() {
            *self.metrics.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    pub fn landed(&mut self, bytes: u64, aliased: bool, superseded: bool) {
        self.metrics.landed += 1;
        self.metrics.bytes_landed += bytes;
        if aliased {
            self.metrics.aliased += 1;
        }
        if superseded {
            self.metrics.superseded += 1;
        }
    }

    pub fn duplicate(&mut self) {
        self.metrics.duplicates += 1;
    }

    pub fn quarantined(&mut self) {
        self.metrics.quarantined += 1;
    }

    pub fn requeued(&mut self) {
        self.metrics.requeued += 1;
    }

    pub fn permanently_failed(&mut self) {
        self.metrics.permanently_failed += 1;
    }

    pub fn storage_conflict(&mut self) {
        self.metrics.storage_conflicts += 1;
    }

    pub fn checkpoint(&mut self) {
        self.metrics.checkpoints += 1;
    }

    pub fn snapshot(&self, elapsed: Duration) -> RunMetrics {
        let mut m = self.metrics.clone();
        m.elapsed_ms = elapsed.as_millis() as u64;
        m
    }
}
