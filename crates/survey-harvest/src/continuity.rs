//! `harvest continuity`: expected vs landed periods per data type.
//!
//! Expected periods come from the configured coverage (ISO weeks or
//! months, the current year truncated to today). Landed periods come from
//! current records. Gaps are listed, as are records that fall outside the
//! expected range.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use survey_harvest_core::backlog::BacklogDefinition;
use survey_harvest_core::models::{FileRecord, PeriodKey, PeriodKind};

use crate::config::Config;
use crate::harvest::{local_today, open_storage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuityReport {
    pub data_type: String,
    pub period_kind: PeriodKind,
    pub start_year: i32,
    pub end_year: i32,
    pub expected_count: usize,
    pub actual_count: usize,
    pub missing: Vec<PeriodKey>,
    /// Logical names of current records outside the expected range.
    pub unexpected: Vec<String>,
}

impl ContinuityReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub fn check(def: &BacklogDefinition, records: &[FileRecord], today: NaiveDate) -> Vec<ContinuityReport> {
    let end_year = def.end_year.unwrap_or_else(|| today.year());
    def.data_types
        .iter()
        .map(|spec| {
            let expected: BTreeSet<PeriodKey> = def.expected(spec, today).into_iter().collect();
            let mine: Vec<&FileRecord> = records
                .iter()
                .filter(|r| r.is_current() && r.data_type == spec.name)
                .collect();
            let have: BTreeSet<PeriodKey> = mine.iter().map(|r| r.period_key).collect();

            ContinuityReport {
                data_type: spec.name.clone(),
                period_kind: spec.period_kind,
                start_year: def.start_year,
                end_year,
                expected_count: expected.len(),
                actual_count: have.intersection(&expected).count(),
                missing: expected.difference(&have).copied().collect(),
                unexpected: mine
                    .iter()
                    .filter(|r| !expected.contains(&r.period_key))
                    .map(|r| r.logical_name.clone())
                    .collect(),
            }
        })
        .collect()
}

/// Run the continuity command. Returns whether every data type is
/// complete.
pub async fn run_continuity(
    config: &Config,
    data_type: Option<String>,
    start_year: Option<i32>,
    end_year: Option<i32>,
    json: bool,
) -> Result<bool> {
    let storage = open_storage(config).await?;
    let records = storage.content.records().await;

    let mut def = config.backlog()?;
    if let Some(name) = &data_type {
        def.data_types.retain(|s| &s.name == name);
        if def.data_types.is_empty() {
            anyhow::bail!("Data type '{}' is not being collected", name);
        }
    }
    if let Some(y) = start_year {
        def.start_year = y;
    }
    if end_year.is_some() {
        def.end_year = end_year;
    }

    let reports = check(&def, &records, local_today());
    let complete = reports.iter().all(ContinuityReport::is_complete);

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(complete);
    }

    println!("continuity {}..{}", def.start_year, def.end_year.map_or("now".to_string(), |y| y.to_string()));
    for r in &reports {
        let status = if r.is_complete() { "ok" } else { "GAPS" };
        println!(
            "  {:<36} {:>5} / {:<5} {}",
            r.data_type, r.actual_count, r.expected_count, status
        );
        for (year, indices) in group_by_year(&r.missing) {
            println!("      {}: {}", year, summarize_indices(&indices));
        }
        for name in &r.unexpected {
            println!("      unexpected: {}", name);
        }
    }
    Ok(complete)
}

pub(crate) fn group_by_year(keys: &[PeriodKey]) -> Vec<(i32, Vec<u32>)> {
    let mut out: Vec<(i32, Vec<u32>)> = Vec::new();
    for key in keys {
        match out.last_mut() {
            Some((year, indices)) if *year == key.year => indices.push(key.index),
            _ => out.push((key.year, vec![key.index])),
        }
    }
    out
}

/// "1-4, 7, 9-12": sorted indices with consecutive runs collapsed.
pub(crate) fn summarize_indices(indices: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut i = 0;
    while i < indices.len() {
        let start = indices[i];
        let mut end = start;
        while i + 1 < indices.len() && indices[i + 1] == end + 1 {
            i += 1;
            end = indices[i];
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
        i += 1;
    }
    parts.join(", ")
}
