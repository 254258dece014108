#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, Utc};
use qcwatch::domain::error::QcwatchError;
use qcwatch::domain::series::{Bar, Series};
use qcwatch::ports::series_port::{SeriesPort, SeriesWindow};
use std::collections::HashMap;
use std::time::Duration;

pub struct MockSeriesPort {
    pub data: HashMap<String, Vec<Bar>>,
    pub errors: HashMap<String, String>,
    pub delays: HashMap<String, Duration>,
}

impl MockSeriesPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
            delays: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, instrument_id: &str, bars: Vec<Bar>) -> Self {
        self.data.insert(instrument_id.to_string(), bars);
        self
    }

    pub fn with_values(self, instrument_id: &str, start: &str, values: &[f64]) -> Self {
        self.with_bars(instrument_id, daily_bars(start, values))
    }

    pub fn with_error(mut self, instrument_id: &str, reason: &str) -> Self {
        self.errors
            .insert(instrument_id.to_string(), reason.to_string());
        self
    }

    pub fn with_delay(mut self, instrument_id: &str, delay: Duration) -> Self {
        self.delays.insert(instrument_id.to_string(), delay);
        self
    }
}

impl SeriesPort for MockSeriesPort {
    fn get_series(&self, instrument_id: &str, window: SeriesWindow) -> Result<Series, QcwatchError> {
        if let Some(delay) = self.delays.get(instrument_id) {
            std::thread::sleep(*delay);
        }
        if let Some(reason) = self.errors.get(instrument_id) {
            return Err(QcwatchError::Database {
                reason: reason.clone(),
            });
        }
        let bars: Vec<Bar> = self
            .data
            .get(instrument_id)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date <= window.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if bars.is_empty() {
            return Err(QcwatchError::DataUnavailable {
                instrument_id: instrument_id.to_string(),
            });
        }
        let start = bars.len().saturating_sub(window.observations);
        Series::new(instrument_id, bars[start..].to_vec())
    }

    fn list_instruments(&self) -> Result<Vec<String>, QcwatchError> {
        let mut ids: Vec<String> = self.data.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn at(s: &str) -> DateTime<Utc> {
    parse_date(s).and_hms_opt(18, 0, 0).unwrap().and_utc()
}

/// One bar per calendar day starting at `start`.
pub fn daily_bars(start: &str, values: &[f64]) -> Vec<Bar> {
    let start = parse_date(start);
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Bar::new(start + chrono::Duration::days(i as i64), *v))
        .collect()
}

pub fn make_series(instrument_id: &str, start: &str, values: &[f64]) -> Series {
    Series::new(instrument_id, daily_bars(start, values)).unwrap()
}
