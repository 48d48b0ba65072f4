//! Storage statistics and health overview.
//!
//! Provides a quick summary of what has been harvested: file counts, bytes,
//! per-data-type and per-year breakdowns, revision history and quarantine.
//! Used by `harvest stats` to give confidence that runs are landing data.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use survey_harvest_core::checkpoint::FailureLedger;
use survey_harvest_core::models::RecordStatus;

use crate::config::Config;
use crate::harvest::open_storage;

/// Per-data-type breakdown of current files.
#[derive(Default)]
struct TypeStats {
    files: u64,
    bytes: u64,
    first: Option<String>,
    last: Option<String>,
    last_retrieved: Option<DateTime<Utc>>,
}

/// Run the stats command: replay the record ledger and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;
    let records = storage.content.records().await;
    let failures = FailureLedger::open(storage.objects.clone(), config.storage.failures_path()).await?;
    let quarantined = storage.content.quarantine_notes().await?;

    let mut current = 0u64;
    let mut superseded = 0u64;
    let mut corrupt = 0u64;
    let mut total_bytes = 0u64;
    let mut by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    let mut by_year: BTreeMap<i32, u64> = BTreeMap::new();

    for r in &records {
        match r.status {
            RecordStatus::Current => {}
            RecordStatus::Superseded { .. } => {
                superseded += 1;
                continue;
            }
            RecordStatus::Corrupt { .. } => {
                corrupt += 1;
                continue;
            }
        }
        current += 1;
        total_bytes += r.byte_size;
        *by_year.entry(r.period_key.year).or_insert(0) += 1;

        let t = by_type.entry(r.data_type.clone()).or_default();
        t.files += 1;
        t.bytes += r.byte_size;
        let key = r.period_key.to_string();
        if t.first.as_ref().map_or(true, |f| &key < f) {
            t.first = Some(key.clone());
        }
        if t.last.as_ref().map_or(true, |l| &key > l) {
            t.last = Some(key);
        }
        if t.last_retrieved.map_or(true, |at| r.retrieved_at > at) {
            t.last_retrieved = Some(r.retrieved_at);
        }
    }

    println!("Survey Harvest — Storage Stats");
    println!("==============================");
    println!();
    println!("  Root:        {}", config.storage.root.display());
    println!("  Files:       {}", current);
    println!("  Size:        {}", format_bytes(total_bytes));
    println!("  Unique:      {} distinct payloads", storage.content.distinct_hashes().await);
    println!("  Superseded:  {}", superseded);
    println!("  Corrupt:     {}", corrupt);
    println!("  Quarantined: {}", quarantined.len());
    println!("  Failed:      {}", failures.len());

    if !by_type.is_empty() {
        println!();
        println!("  By data type:");
        println!(
            "  {:<36} {:>6} {:>10}   {:<8} {:<8}   {}",
            "DATA TYPE", "FILES", "SIZE", "FIRST", "LAST", "LAST FETCH"
        );
        println!("  {}", "-".repeat(92));
        for (name, t) in &by_type {
            let fetched = t
                .last_retrieved
                .map(|at| format_ts_relative(at.timestamp()))
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<36} {:>6} {:>10}   {:<8} {:<8}   {}",
                name,
                t.files,
                format_bytes(t.bytes),
                t.first.as_deref().unwrap_or("-"),
                t.last.as_deref().unwrap_or("-"),
                fetched
            );
        }
    }

    if !by_year.is_empty() {
        println!();
        println!("  By year:");
        for (year, n) in &by_year {
            println!("  {:<8} {:>6}", year, n);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a millisecond span as "850 ms", "12.3 s" or "1 h 05 min".
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1_000.0)
    } else if ms < 3_600_000 {
        format!("{} min {:02} s", ms / 60_000, (ms % 60_000) / 1_000)
    } else {
        format!("{} h {:02} min", ms / 3_600_000, (ms % 3_600_000) / 60_000)
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
