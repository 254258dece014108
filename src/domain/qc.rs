//! Data-quality evaluation: missing days, staleness and rolling outliers.
//!
//! - `missing_pct`: over the trailing `missing_window` observations, the share
//!   of calendar-expected dates with no finite observation.
//! - `days_stale`: expected days elapsed between the last bar and `as_of`,
//!   counted with the staleness calendar. `+inf` for an empty series.
//! - outliers: a bar is flagged when `|x - MEAN(w)| > k * STDDEV(w)` over the
//!   trailing `outlier_window` bars ending at that bar. Windows with fewer than
//!   two finite points, or zero deviation, never flag.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::calendar::Calendar;
use crate::domain::series::Series;
use crate::domain::stats;

pub const DEFAULT_MISSING_WINDOW: usize = 30;
pub const DEFAULT_OUTLIER_WINDOW: usize = 20;
pub const DEFAULT_OUTLIER_K: f64 = 3.0;

/// More missing expected days than this fails a QC report.
pub const REPORT_MAX_MISSING_DAYS: usize = 10;

const REPORT_MISSING_DATES_SHOWN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QcConfig {
    pub missing_window: usize,
    pub outlier_window: usize,
    pub outlier_k: f64,
    pub calendar: Calendar,
    pub staleness_calendar: Calendar,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            missing_window: DEFAULT_MISSING_WINDOW,
            outlier_window: DEFAULT_OUTLIER_WINDOW,
            outlier_k: DEFAULT_OUTLIER_K,
            calendar: Calendar::BusinessDays,
            staleness_calendar: Calendar::CalendarDays,
        }
    }
}

/// Per-rule overrides layered on top of the global QC configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QcOverrides {
    pub missing_window: Option<usize>,
    pub outlier_window: Option<usize>,
    pub outlier_k: Option<f64>,
}

impl QcConfig {
    pub fn with_overrides(&self, overrides: &QcOverrides) -> QcConfig {
        QcConfig {
            missing_window: overrides.missing_window.unwrap_or(self.missing_window),
            outlier_window: overrides.outlier_window.unwrap_or(self.outlier_window),
            outlier_k: overrides.outlier_k.unwrap_or(self.outlier_k),
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QcSignal {
    pub instrument_id: String,
    pub missing_pct: f64,
    pub days_stale: f64,
    pub outlier_flags: BTreeSet<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl QcSignal {
    pub fn is_latest_outlier(&self) -> bool {
        self.last_date
            .is_some_and(|d| self.outlier_flags.contains(&d))
    }
}

pub fn evaluate_qc(series: &Series, config: &QcConfig, as_of: NaiveDate) -> QcSignal {
    let instrument_id = series.instrument_id().to_string();

    let Some(last_date) = series.last_date() else {
        return QcSignal {
            instrument_id,
            missing_pct: 1.0,
            days_stale: f64::INFINITY,
            outlier_flags: BTreeSet::new(),
            last_date: None,
        };
    };

    QcSignal {
        instrument_id,
        missing_pct: missing_pct(series, config),
        days_stale: config.staleness_calendar.days_between(last_date, as_of) as f64,
        outlier_flags: outlier_dates(series, config.outlier_window, config.outlier_k),
        last_date: Some(last_date),
    }
}

fn missing_pct(series: &Series, config: &QcConfig) -> f64 {
    let window = series.tail(config.missing_window.max(1));
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return 1.0;
    };

    let expected = config.calendar.expected_dates(first.date, last.date);
    if expected.is_empty() {
        return 0.0;
    }

    let observed: BTreeSet<NaiveDate> = window
        .iter()
        .filter(|b| b.value.is_finite())
        .map(|b| b.date)
        .collect();
    let missing = expected.iter().filter(|d| !observed.contains(d)).count();
    missing as f64 / expected.len() as f64
}

pub fn outlier_dates(series: &Series, window: usize, k: f64) -> BTreeSet<NaiveDate> {
    let values = series.values();
    let mut flags = BTreeSet::new();

    for (i, bar) in series.bars().iter().enumerate() {
        if !bar.value.is_finite() {
            continue;
        }
        let finite: Vec<f64> = stats::trailing_window(&values, i, window.max(1))
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if let Some((m, sd)) = stats::mean_and_stddev(&finite) {
            if (bar.value - m).abs() > k * sd {
                flags.insert(bar.date);
            }
        }
    }

    flags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QcStatus {
    Passed,
    Failed,
}

/// Full data-quality report for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QcReport {
    pub instrument_id: String,
    pub as_of: NaiveDate,
    pub total_bars: usize,
    pub signal: QcSignal,
    pub non_finite_values: usize,
    pub missing_days: usize,
    pub missing_dates: Vec<NaiveDate>,
    pub max_gap_days: i64,
    pub status: QcStatus,
}

pub fn run_qc_report(series: &Series, config: &QcConfig, as_of: NaiveDate) -> QcReport {
    let signal = evaluate_qc(series, config, as_of);
    let non_finite_values = series
        .bars()
        .iter()
        .filter(|b| !b.value.is_finite())
        .count();

    let mut missing: Vec<NaiveDate> = match (series.first_date(), series.last_date()) {
        (Some(first), Some(last)) => {
            let present: BTreeSet<NaiveDate> = series.bars().iter().map(|b| b.date).collect();
            config
                .calendar
                .expected_dates(first, last)
                .into_iter()
                .filter(|d| !present.contains(d))
                .collect()
        }
        _ => Vec::new(),
    };
    let missing_days = missing.len();
    missing.truncate(REPORT_MISSING_DATES_SHOWN);

    let max_gap_days = series
        .bars()
        .windows(2)
        .map(|w| (w[1].date - w[0].date).num_days())
        .max()
        .unwrap_or(0);

    let failed = series.is_empty()
        || !signal.outlier_flags.is_empty()
        || missing_days > REPORT_MAX_MISSING_DAYS;

    QcReport {
        instrument_id: series.instrument_id().to_string(),
        as_of,
        total_bars: series.len(),
        signal,
        non_finite_values,
        missing_days,
        missing_dates: missing,
        max_gap_days,
        status: if failed {
            QcStatus::Failed
        } else {
            QcStatus::Passed
        },
    }
}
