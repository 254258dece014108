//! Daily observation series for one instrument.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::error::QcwatchError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub value: f64,
    pub volume: Option<i64>,
}

impl Bar {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self {
            date,
            value,
            volume: None,
        }
    }
}

/// Immutable snapshot of an instrument's bars: strictly increasing dates.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    instrument_id: String,
    bars: Vec<Bar>,
}

impl Series {
    /// Build a series, rejecting out-of-order or duplicate dates.
    pub fn new(instrument_id: impl Into<String>, bars: Vec<Bar>) -> Result<Self, QcwatchError> {
        let instrument_id = instrument_id.into();
        for pair in bars.windows(2) {
            if pair[1].date == pair[0].date {
                return Err(QcwatchError::SeriesInvalid {
                    instrument_id,
                    reason: format!("duplicate date {}", pair[1].date),
                });
            }
            if pair[1].date < pair[0].date {
                return Err(QcwatchError::SeriesInvalid {
                    instrument_id,
                    reason: format!("{} follows {}", pair[1].date, pair[0].date),
                });
            }
        }
        Ok(Self {
            instrument_id,
            bars,
        })
    }

    /// Sort bars by date first; duplicates are still rejected.
    pub fn from_unsorted(
        instrument_id: impl Into<String>,
        mut bars: Vec<Bar>,
    ) -> Result<Self, QcwatchError> {
        bars.sort_by_key(|b| b.date);
        Self::new(instrument_id, bars)
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// The bar before the latest one.
    pub fn previous(&self) -> Option<&Bar> {
        self.bars.len().checked_sub(2).map(|i| &self.bars[i])
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    pub fn values(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.value).collect()
    }

    /// The last `n` bars (or all of them if fewer exist).
    pub fn tail(&self, n: usize) -> &[Bar] {
        let start = self.bars.len().saturating_sub(n);
        &self.bars[start..]
    }

    /// Value pairs for dates present in both series, in date order.
    pub fn align(&self, other: &Series) -> Vec<(f64, f64)> {
        let mut pairs = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.bars.len() && j < other.bars.len() {
            let (a, b) = (&self.bars[i], &other.bars[j]);
            match a.date.cmp(&b.date) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    if a.value.is_finite() && b.value.is_finite() {
                        pairs.push((a.value, b.value));
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn rejects_duplicate_dates() {
        let err = Series::new("TTF", vec![Bar::new(d(1), 1.0), Bar::new(d(1), 2.0)]).unwrap_err();
        assert!(err.to_string().contains("duplicate date 2024-03-01"));
    }

    #[test]
    fn rejects_unordered_dates() {
        let err = Series::new("TTF", vec![Bar::new(d(2), 1.0), Bar::new(d(1), 2.0)]).unwrap_err();
        assert!(matches!(err, QcwatchError::SeriesInvalid { .. }));
    }

    #[test]
    fn from_unsorted_orders_bars() {
        let s = Series::from_unsorted(
            "TTF",
            vec![Bar::new(d(3), 3.0), Bar::new(d(1), 1.0), Bar::new(d(2), 2.0)],
        )
        .unwrap();
        assert_eq!(s.values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(s.first_date(), Some(d(1)));
        assert_eq!(s.last_date(), Some(d(3)));
    }

    #[test]
    fn latest_and_previous() {
        let s = Series::new("HH", vec![Bar::new(d(1), 10.0), Bar::new(d(2), 11.0)]).unwrap();
        assert_eq!(s.latest().unwrap().value, 11.0);
        assert_eq!(s.previous().unwrap().value, 10.0);

        let single = Series::new("HH", vec![Bar::new(d(1), 10.0)]).unwrap();
        assert!(single.previous().is_none());
    }

    #[test]
    fn tail_clamps_to_length() {
        let s = Series::new("HH", vec![Bar::new(d(1), 1.0), Bar::new(d(2), 2.0)]).unwrap();
        assert_eq!(s.tail(5).len(), 2);
        assert_eq!(s.tail(1)[0].value, 2.0);
    }

    #[test]
    fn align_inner_joins_on_date() {
        let a = Series::new(
            "A",
            vec![Bar::new(d(1), 1.0), Bar::new(d(2), 2.0), Bar::new(d(4), 4.0)],
        )
        .unwrap();
        let b = Series::new(
            "B",
            vec![Bar::new(d(2), 20.0), Bar::new(d(3), 30.0), Bar::new(d(4), f64::NAN)],
        )
        .unwrap();
        assert_eq!(a.align(&b), vec![(2.0, 20.0)]);
    }
}
