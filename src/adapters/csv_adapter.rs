//! CSV directory series adapter: one `<instrument>.csv` per instrument with
//! a `date,value[,volume]` header (`close` is accepted in place of `value`).

use crate::domain::error::QcwatchError;
use crate::domain::series::{Bar, Series};
use crate::ports::series_port::{SeriesPort, SeriesWindow};
use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Instrument ids name files directly under the base directory, so only
    /// ASCII letters, digits, `_`, `-` and non-leading `.` are accepted.
    fn csv_path(&self, instrument_id: &str) -> Result<PathBuf, QcwatchError> {
        let plain = !instrument_id.is_empty()
            && !instrument_id.starts_with('.')
            && instrument_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !plain {
            return Err(QcwatchError::SeriesInvalid {
                instrument_id: instrument_id.to_string(),
                reason: "instrument id is not a plain file name".into(),
            });
        }
        Ok(self.base_path.join(format!("{}.csv", instrument_id)))
    }

    fn read_bars(&self, instrument_id: &str) -> Result<Vec<Bar>, QcwatchError> {
        let path = self.csv_path(instrument_id)?;
        if !path.is_file() {
            return Err(QcwatchError::DataUnavailable {
                instrument_id: instrument_id.to_string(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|e| QcwatchError::Database {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let invalid = |reason: String| QcwatchError::SeriesInvalid {
            instrument_id: instrument_id.to_string(),
            reason,
        };

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr
            .headers()
            .map_err(|e| invalid(format!("CSV header error: {}", e)))?
            .clone();
        let column = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.contains(&h.trim().to_lowercase().as_str()))
        };
        let date_col = column(&["date"]).ok_or_else(|| invalid("missing date column".into()))?;
        let value_col =
            column(&["value", "close"]).ok_or_else(|| invalid("missing value column".into()))?;
        let volume_col = column(&["volume"]);

        let mut bars = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| invalid(format!("CSV parse error: {}", e)))?;

            let date_str = record.get(date_col).unwrap_or("").trim();
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
                invalid(format!("row {}: invalid date '{}': {}", line + 1, date_str, e))
            })?;

            // A blank cell is a missing observation, kept as NaN.
            let raw_value = record.get(value_col).unwrap_or("").trim();
            let value = if raw_value.is_empty() {
                f64::NAN
            } else {
                raw_value.parse::<f64>().map_err(|e| {
                    invalid(format!("row {}: invalid value '{}': {}", line + 1, raw_value, e))
                })?
            };

            let volume = match volume_col.and_then(|c| record.get(c)).map(str::trim) {
                None | Some("") => None,
                Some(raw) => Some(raw.parse::<i64>().map_err(|e| {
                    invalid(format!("row {}: invalid volume '{}': {}", line + 1, raw, e))
                })?),
            };

            bars.push(Bar {
                date,
                value,
                volume,
            });
        }
        Ok(bars)
    }
}

impl SeriesPort for CsvAdapter {
    fn get_series(&self, instrument_id: &str, window: SeriesWindow) -> Result<Series, QcwatchError> {
        let bars: Vec<Bar> = self
            .read_bars(instrument_id)?
            .into_iter()
            .filter(|b| b.date <= window.end)
            .collect();
        let series = Series::from_unsorted(instrument_id, bars)?;

        let tail = series.tail(window.observations).to_vec();
        if tail.is_empty() {
            return Err(QcwatchError::DataUnavailable {
                instrument_id: instrument_id.to_string(),
            });
        }
        Series::new(instrument_id, tail)
    }

    fn list_instruments(&self) -> Result<Vec<String>, QcwatchError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| QcwatchError::Database {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut instruments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QcwatchError::Database {
                reason: format!("directory entry error: {}", e),
            })?;
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".csv") {
                instruments.push(id.to_string());
            }
        }

        instruments.sort();
        Ok(instruments)
    }
}
