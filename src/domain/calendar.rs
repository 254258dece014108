//! Expected-observation calendars for missing-day and staleness checks.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calendar {
    /// Monday to Friday; no holiday table.
    #[default]
    BusinessDays,
    CalendarDays,
}

impl Calendar {
    pub fn is_expected(self, date: NaiveDate) -> bool {
        match self {
            Calendar::BusinessDays => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
            Calendar::CalendarDays => true,
        }
    }

    /// Expected dates in `[start, end]`, inclusive.
    pub fn expected_dates(self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if end < start {
            return Vec::new();
        }
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_expected(*d))
            .collect()
    }

    /// Number of expected days strictly after `from` up to and including `to`.
    /// Zero when `to` is not after `from`.
    pub fn days_between(self, from: NaiveDate, to: NaiveDate) -> i64 {
        if to <= from {
            return 0;
        }
        match self {
            Calendar::CalendarDays => (to - from).num_days(),
            Calendar::BusinessDays => from
                .iter_days()
                .skip(1)
                .take_while(|d| *d <= to)
                .filter(|d| self.is_expected(*d))
                .count() as i64,
        }
    }
}

impl FromStr for Calendar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "business" | "business_days" | "trading" => Ok(Calendar::BusinessDays),
            "calendar" | "calendar_days" | "daily" => Ok(Calendar::CalendarDays),
            other => Err(format!(
                "unknown calendar '{}', expected 'business' or 'calendar'",
                other
            )),
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calendar::BusinessDays => write!(f, "business"),
            Calendar::CalendarDays => write!(f, "calendar"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn business_days_skip_weekends() {
        // 2024-03-01 is a Friday.
        let dates = Calendar::BusinessDays.expected_dates(d(2024, 3, 1), d(2024, 3, 5));
        assert_eq!(dates, vec![d(2024, 3, 1), d(2024, 3, 4), d(2024, 3, 5)]);
    }

    #[test]
    fn calendar_days_include_everything() {
        let dates = Calendar::CalendarDays.expected_dates(d(2024, 3, 1), d(2024, 3, 5));
        assert_eq!(dates.len(), 5);
    }

    #[test]
    fn reversed_range_is_empty() {
        assert!(Calendar::CalendarDays
            .expected_dates(d(2024, 3, 5), d(2024, 3, 1))
            .is_empty());
    }

    #[test]
    fn days_between_calendar() {
        assert_eq!(Calendar::CalendarDays.days_between(d(2024, 3, 1), d(2024, 3, 6)), 5);
        assert_eq!(Calendar::CalendarDays.days_between(d(2024, 3, 6), d(2024, 3, 1)), 0);
    }

    #[test]
    fn days_between_business() {
        // Fri -> next Wed: Mon, Tue, Wed.
        assert_eq!(Calendar::BusinessDays.days_between(d(2024, 3, 1), d(2024, 3, 6)), 3);
        // Fri -> Sun: nothing expected.
        assert_eq!(Calendar::BusinessDays.days_between(d(2024, 3, 1), d(2024, 3, 3)), 0);
    }

    #[test]
    fn parse_names() {
        assert_eq!("business".parse::<Calendar>().unwrap(), Calendar::BusinessDays);
        assert_eq!(" Calendar ".parse::<Calendar>().unwrap(), Calendar::CalendarDays);
        assert!("lunar".parse::<Calendar>().is_err());
    }
}
