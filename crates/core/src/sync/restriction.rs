//! Table and time-range filters applied to synchronization.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Limits which actions are read for one table: only actions whose sample
/// time satisfies `start_time <= t < end_time` (unix millis) pass. Only
/// meaningful for tables with a time column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRangeRestriction {
    pub table: String,
    pub start_time: i64,
    pub end_time: i64,
}

impl TimeRangeRestriction {
    /// A start time that selects all records of `date` in any time zone: one
    /// day before the date, at UTC midnight.
    pub fn start_time_for_date(date: NaiveDate) -> i64 {
        date_millis(date.checked_sub_days(Days::new(1)).unwrap_or(date))
    }

    /// An end time that selects all records of dates before `date` in any
    /// time zone: two days past the date, at UTC midnight.
    pub fn end_time_for_date(date: NaiveDate) -> i64 {
        date_millis(date.checked_add_days(Days::new(2)).unwrap_or(date))
    }
}

fn date_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        .timestamp_millis()
}

/// Include/exclude filter over table names. Reserved tables (leading
/// underscore) never pass; excludes beat includes; an empty include list
/// means "all tables".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableFilter {
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl TableFilter {
    pub fn includes(&self, table: &str) -> bool {
        if table.starts_with('_') {
            return false;
        }
        if self.exclude_tables.iter().any(|t| t == table) {
            return false;
        }
        if !self.include_tables.is_empty() && !self.include_tables.iter().any(|t| t == table) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tables_never_pass() {
        let filter = TableFilter {
            include_tables: vec!["_meta".to_string()],
            exclude_tables: vec![],
        };
        assert!(!filter.includes("_meta"));
    }

    #[test]
    fn exclude_beats_include() {
        let filter = TableFilter {
            include_tables: vec!["heart_rate".to_string()],
            exclude_tables: vec!["heart_rate".to_string()],
        };
        assert!(!filter.includes("heart_rate"));
    }

    #[test]
    fn empty_include_means_all() {
        let filter = TableFilter::default();
        assert!(filter.includes("heart_rate"));
    }

    #[test]
    fn date_bounds_carry_slack() {
        let date: NaiveDate = "2024-01-02".parse().unwrap();
        let start = TimeRangeRestriction::start_time_for_date(date);
        let end = TimeRangeRestriction::end_time_for_date(date);
        // One day before at UTC midnight, two days after at UTC midnight.
        assert_eq!(start, 1_704_067_200_000);
        assert_eq!(end, 1_704_326_400_000);
    }
}
