//! `harvest missing`: cells with no healthy file, grouped by data type and
//! year.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use survey_harvest_core::backlog;
use survey_harvest_core::models::PeriodKey;

use crate::config::Config;
use crate::continuity::{group_by_year, summarize_indices};
use crate::harvest::{local_today, open_storage};

#[derive(Debug, Serialize)]
struct MissingReport<'a> {
    checked_on: String,
    total_missing: usize,
    data_types: &'a BTreeMap<String, Vec<PeriodKey>>,
}

/// Print missing cells. Returns the number of missing cells.
pub async fn run_missing(config: &Config, json: bool) -> Result<usize> {
    let storage = open_storage(config).await?;
    let landed = storage.content.landed_keys().await;
    let def = config.backlog()?;
    let today = local_today();

    let missing = backlog::missing(&def, &landed, today);
    let total: usize = missing.values().map(Vec::len).sum();

    if json {
        let report = MissingReport {
            checked_on: today.to_string(),
            total_missing: total,
            data_types: &missing,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(total);
    }

    println!("missing as of {}", today);
    if missing.is_empty() {
        println!("  nothing missing");
        return Ok(0);
    }
    for (data_type, keys) in &missing {
        println!("  [{}] {} missing", data_type, keys.len());
        for (year, indices) in group_by_year(keys) {
            println!("    {}: {}", year, summarize_indices(&indices));
        }
    }
    println!();
    println!("  total missing: {}", total);
    Ok(total)
}
