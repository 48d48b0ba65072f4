//! `harvest verify`: post-hoc integrity check of landed files.
//!
//! Re-hashes every current file against its ledger entry and re-runs the
//! structural checks of the quality gate. With `--mark-corrupt`, offending
//! records are flagged so the next run fetches them again.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

use survey_harvest_core::content::VerifyProblem;
use survey_harvest_core::models::{FileRecord, WorkItem};
use survey_harvest_core::quality::{HistoricalBaseline, QualityGate};
use survey_harvest_core::error::StoreError;

use crate::config::Config;
use crate::harvest::open_storage;

fn work_item(record: &FileRecord) -> WorkItem {
    WorkItem {
        data_type: record.data_type.clone(),
        period_kind: record.period_kind,
        period_key: record.period_key,
        source: record.source.clone(),
    }
}

/// Run the verify command. Returns `true` when every current file is
/// intact and still passes the structural checks.
pub async fn run_verify(config: &Config, mark_corrupt: bool) -> Result<bool> {
    let storage = open_storage(config).await?;
    let gate = QualityGate::new(config.quality()?);
    let empty = HistoricalBaseline::default();

    // logical name -> problem
    let mut problems: BTreeMap<String, String> = BTreeMap::new();

    for finding in storage.content.verify().await? {
        let problem = match &finding.problem {
            VerifyProblem::Missing => {
                format!("file missing at {}", finding.path)
            }
            VerifyProblem::HashMismatch { actual } => {
                format!("hash mismatch, now {}", &actual[..actual.len().min(12)])
            }
        };
        problems.insert(finding.logical_name, problem);
    }

    let current = storage.content.current_records().await;
    for record in &current {
        if problems.contains_key(&record.logical_name) {
            continue;
        }
        let bytes = match storage.content.read_payload(record).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let verdict = gate.evaluate(&bytes, &work_item(record), &empty);
        if !verdict.accepted {
            problems.insert(
                record.logical_name.clone(),
                format!("fails checks: {}", verdict.errors.join("; ")),
            );
        }
    }

    println!("verify: {} current files", current.len());
    if problems.is_empty() {
        println!("  all files intact");
        return Ok(true);
    }

    for (name, problem) in &problems {
        println!("  {:<44} {}", name, problem);
        if mark_corrupt {
            match storage.content.mark_corrupt(name).await? {
                Some(_) => println!("    marked corrupt"),
                None => warn!(logical = %name, "no live record to mark"),
            }
        }
    }
    println!();
    println!("  {} problem(s)", problems.len());
    if !mark_corrupt {
        println!("  re-run with --mark-corrupt to re-fetch them on the next run");
    }
    Ok(false)
}
