//! Series accessor port.

use chrono::NaiveDate;

use crate::domain::error::QcwatchError;
use crate::domain::series::Series;

/// Which bars to fetch: the last `observations` bars dated on or before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesWindow {
    pub end: NaiveDate,
    pub observations: usize,
}

impl SeriesWindow {
    pub fn new(end: NaiveDate, observations: usize) -> Self {
        Self { end, observations }
    }
}

pub trait SeriesPort: Send + Sync {
    /// Fails with `DataUnavailable` when the instrument is unknown or has no
    /// bars inside the window.
    fn get_series(&self, instrument_id: &str, window: SeriesWindow) -> Result<Series, QcwatchError>;

    fn list_instruments(&self) -> Result<Vec<String>, QcwatchError>;
}
