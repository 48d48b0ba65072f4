//! Backlog enumeration: which (data type, period) cells to fetch.
//!
//! Weekly tables use ISO weeks. A year has as many weeks as the ISO week
//! number of 28 December, and a week is filed under the month of its
//! Monday.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::models::{DataTypeSpec, PeriodKey, PeriodKind, WorkItem};

pub fn weeks_in_year(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}

pub fn month_of_week(year: i32, week: u32) -> u32 {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
        .map(|d| d.month())
        .unwrap_or(if week <= 1 { 1 } else { 12 })
}

/// Periods of `year` that have been published as of `today`.
///
/// Past years are complete. The current year stops at today's ISO week
/// (or month); during the first days of January that still belong to the
/// previous ISO year no weeks of the new year are due yet.
pub fn periods(kind: PeriodKind, year: i32, today: NaiveDate) -> Vec<PeriodKey> {
    let last = match kind {
        PeriodKind::Monthly if year < today.year() => 12,
        PeriodKind::Monthly if year == today.year() => today.month(),
        PeriodKind::Weekly if year < today.year() => weeks_in_year(year),
        PeriodKind::Weekly if year == today.year() => {
            let iso = today.iso_week();
            if iso.year() == year {
                iso.week().min(weeks_in_year(year))
            } else {
                0
            }
        }
        _ => 0,
    };
    (1..=last).map(|i| PeriodKey::new(year, i)).collect()
}

/// Coverage the collector is asked to maintain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogDefinition {
    pub data_types: Vec<DataTypeSpec>,
    pub start_year: i32,
    /// Defaults to the current year.
    pub end_year: Option<i32>,
    /// Skip cells that already hold a landed file.
    pub incremental: bool,
    /// Re-enumerate the newest cells of each data type even when landed,
    /// since upstream revises recent figures.
    pub refresh_recent_periods: usize,
}

impl BacklogDefinition {
    fn years(&self, today: NaiveDate) -> std::ops::RangeInclusive<i32> {
        self.start_year..=self.end_year.unwrap_or(today.year())
    }

    /// All cells due for one data type, oldest first.
    pub fn expected(&self, spec: &DataTypeSpec, today: NaiveDate) -> Vec<PeriodKey> {
        self.years(today)
            .flat_map(|year| periods(spec.period_kind, year, today))
            .collect()
    }
}

/// Build the backlog.
///
/// `landed` holds the cells with a healthy file; `excluded` holds keys
/// ([`WorkItem::key`]) of items that failed permanently.
pub fn enumerate(
    def: &BacklogDefinition,
    landed: &BTreeSet<(String, PeriodKey)>,
    excluded: &BTreeSet<String>,
    today: NaiveDate,
) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for spec in &def.data_types {
        let expected = def.expected(spec, today);
        let refresh_from = expected.len().saturating_sub(def.refresh_recent_periods);
        for (i, key) in expected.into_iter().enumerate() {
            let item = spec.work_item(key);
            if excluded.contains(&item.key()) {
                continue;
            }
            let have = landed.contains(&(spec.name.clone(), key));
            if def.incremental && have && i < refresh_from {
                continue;
            }
            items.push(item);
        }
    }
    items
}

/// Cells with no healthy file, per data type. Data types with nothing
/// missing are omitted.
pub fn missing(
    def: &BacklogDefinition,
    landed: &BTreeSet<(String, PeriodKey)>,
    today: NaiveDate,
) -> BTreeMap<String, Vec<PeriodKey>> {
    let mut out = BTreeMap::new();
    for spec in &def.data_types {
        let lost: Vec<PeriodKey> = def
            .expected(spec, today)
            .into_iter()
            .filter(|k| !landed.contains(&(spec.name.clone(), *k)))
            .collect();
        if !lost.is_empty() {
            out.insert(spec.name.clone(), lost);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceParameters;

    fn spec(name: &str, kind: PeriodKind) -> DataTypeSpec {
        DataTypeSpec {
            name: name.into(),
            period_kind: kind,
            source: SourceParameters {
                report_type: "0".into(),
                endpoint: "dlwage.do".into(),
                pref_code: "13".into(),
                hc_code: "00".into(),
                epid_code: "00".into(),
                total_mode: "0".into(),
            },
            expected_columns: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weeks_in_year() {
        assert_eq!(weeks_in_year(2020), 53);
        assert_eq!(weeks_in_year(2021), 52);
        assert_eq!(weeks_in_year(2026), 53);
    }

    #[test]
    fn test_month_of_week() {
        assert_eq!(month_of_week(2024, 1), 1);
        assert_eq!(month_of_week(2024, 7), 2);
        // ISO week 1 of 2025 starts Monday 30 December 2024
        assert_eq!(month_of_week(2025, 1), 12);
    }

    #[test]
    fn test_periods_current_year_truncated() {
        let today = day(2024, 3, 15);
        assert_eq!(periods(PeriodKind::Monthly, 2024, today).len(), 3);
        assert_eq!(periods(PeriodKind::Weekly, 2024, today).len(), 11);
        assert_eq!(periods(PeriodKind::Weekly, 2023, today).len(), 52);
        assert!(periods(PeriodKind::Monthly, 2025, today).is_empty());
    }

    #[test]
    fn test_periods_early_january_has_no_weeks() {
        // 1 January 2027 belongs to ISO week 53 of 2026
        let today = day(2027, 1, 1);
        assert!(periods(PeriodKind::Weekly, 2027, today).is_empty());
        assert_eq!(periods(PeriodKind::Monthly, 2027, today).len(), 1);
    }

    fn def(incremental: bool, refresh: usize) -> BacklogDefinition {
        BacklogDefinition {
            data_types: vec![spec("sentinel_monthly_age", PeriodKind::Monthly)],
            start_year: 2023,
            end_year: None,
            incremental,
            refresh_recent_periods: refresh,
        }
    }

    #[test]
    fn test_enumerate_full() {
        let items = enumerate(&def(false, 0), &BTreeSet::new(), &BTreeSet::new(), day(2024, 4, 2));
        assert_eq!(items.len(), 16);
        assert_eq!(items[0].period_key, PeriodKey::new(2023, 1));
        assert_eq!(items[15].period_key, PeriodKey::new(2024, 4));
    }

    #[test]
    fn test_enumerate_incremental_skips_landed_but_refreshes_recent() {
        let today = day(2024, 4, 2);
        let mut landed = BTreeSet::new();
        for m in 1..=4 {
            landed.insert(("sentinel_monthly_age".to_string(), PeriodKey::new(2024, m)));
        }
        let items = enumerate(&def(true, 2), &landed, &BTreeSet::new(), today);
        let keys: Vec<PeriodKey> = items.iter().map(|i| i.period_key).collect();
        assert_eq!(keys.len(), 12 + 2);
        assert!(keys.contains(&PeriodKey::new(2024, 3)));
        assert!(keys.contains(&PeriodKey::new(2024, 4)));
        assert!(!keys.contains(&PeriodKey::new(2024, 2)));
    }

    #[test]
    fn test_enumerate_skips_excluded() {
        let d = def(false, 0);
        let excluded: BTreeSet<String> = ["sentinel_monthly_age/2023-05".to_string()].into();
        let items = enumerate(&d, &BTreeSet::new(), &excluded, day(2023, 6, 1));
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.period_key != PeriodKey::new(2023, 5)));
    }

    #[test]
    fn test_missing_report() {
        let d = def(true, 0);
        let landed: BTreeSet<_> = (1..=12)
            .filter(|m| *m != 7)
            .map(|m| ("sentinel_monthly_age".to_string(), PeriodKey::new(2023, m)))
            .collect();
        let report = missing(&d, &landed, day(2023, 12, 31));
        assert_eq!(report["sentinel_monthly_age"], vec![PeriodKey::new(2023, 7)]);
    }
}
