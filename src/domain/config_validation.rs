//! Configuration validation.
//!
//! Builds typed settings from the INI config port and rejects bad values
//! before any evaluation run starts.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::calendar::Calendar;
use crate::domain::engine::{EngineConfig, DEFAULT_HISTORY_PADDING, DEFAULT_SERIES_TIMEOUT_MS};
use crate::domain::error::QcwatchError;
use crate::domain::qc::{QcConfig, DEFAULT_MISSING_WINDOW, DEFAULT_OUTLIER_K, DEFAULT_OUTLIER_WINDOW};
use crate::ports::config_port::ConfigPort;

pub const DEFAULT_DB_PATH: &str = "qcwatch.db";
pub const DEFAULT_POOL_SIZE: u32 = 4;
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 5000;

/// Where series come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Sqlite,
    Csv { dir: PathBuf },
}

/// Where rule definitions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Sqlite,
    File { path: PathBuf },
}

/// A notification channel named in `[notify] channels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelConfig {
    Log,
    Webhook { url: String, timeout: Duration },
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> QcwatchError {
    QcwatchError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn missing(section: &str, key: &str) -> QcwatchError {
    QcwatchError::ConfigMissing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

/// A present, non-blank value.
fn value(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a present value strictly; absent keys fall back to `default`.
fn parsed<T: FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: T,
) -> Result<T, QcwatchError> {
    match value(config, section, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| invalid(section, key, format!("cannot parse '{}'", raw))),
    }
}

fn calendar(
    config: &dyn ConfigPort,
    key: &str,
    default: Calendar,
) -> Result<Calendar, QcwatchError> {
    match value(config, "qc", key) {
        None => Ok(default),
        Some(raw) => raw.parse::<Calendar>().map_err(|e| invalid("qc", key, e)),
    }
}

pub fn build_qc_config(config: &dyn ConfigPort) -> Result<QcConfig, QcwatchError> {
    let defaults = QcConfig::default();

    let missing_window: usize = parsed(config, "qc", "missing_window", DEFAULT_MISSING_WINDOW)?;
    if missing_window == 0 {
        return Err(invalid("qc", "missing_window", "missing_window must be at least 1"));
    }

    let outlier_window: usize = parsed(config, "qc", "outlier_window", DEFAULT_OUTLIER_WINDOW)?;
    if outlier_window < 2 {
        return Err(invalid("qc", "outlier_window", "outlier_window must be at least 2"));
    }

    let outlier_k: f64 = parsed(config, "qc", "outlier_k", DEFAULT_OUTLIER_K)?;
    if !outlier_k.is_finite() || outlier_k <= 0.0 {
        return Err(invalid("qc", "outlier_k", "outlier_k must be positive"));
    }

    Ok(QcConfig {
        missing_window,
        outlier_window,
        outlier_k,
        calendar: calendar(config, "calendar", defaults.calendar)?,
        staleness_calendar: calendar(config, "staleness_calendar", defaults.staleness_calendar)?,
    })
}

pub fn build_engine_config(config: &dyn ConfigPort) -> Result<EngineConfig, QcwatchError> {
    let timeout_ms: u64 = parsed(config, "engine", "series_timeout_ms", DEFAULT_SERIES_TIMEOUT_MS)?;
    let workers: usize = parsed(config, "engine", "workers", 0)?;
    let history_padding: usize = parsed(config, "engine", "history_padding", DEFAULT_HISTORY_PADDING)?;

    Ok(EngineConfig {
        qc: build_qc_config(config)?,
        series_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        workers,
        history_padding,
    })
}

pub fn sqlite_path(config: &dyn ConfigPort) -> PathBuf {
    value(config, "sqlite", "path")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

pub fn sqlite_pool_size(config: &dyn ConfigPort) -> Result<u32, QcwatchError> {
    let size: u32 = parsed(config, "sqlite", "pool_size", DEFAULT_POOL_SIZE)?;
    if size == 0 {
        return Err(invalid("sqlite", "pool_size", "pool_size must be at least 1"));
    }
    Ok(size)
}

pub fn data_source(config: &dyn ConfigPort) -> Result<DataSource, QcwatchError> {
    match value(config, "data", "source").as_deref().map(str::to_lowercase).as_deref() {
        None | Some("sqlite") => Ok(DataSource::Sqlite),
        Some("csv") => {
            let dir = value(config, "data", "csv_dir").ok_or_else(|| missing("data", "csv_dir"))?;
            Ok(DataSource::Csv {
                dir: PathBuf::from(dir),
            })
        }
        Some(other) => Err(invalid(
            "data",
            "source",
            format!("unknown source '{}', expected 'sqlite' or 'csv'", other),
        )),
    }
}

pub fn rule_source(config: &dyn ConfigPort) -> Result<RuleSource, QcwatchError> {
    match value(config, "rules", "source").as_deref().map(str::to_lowercase).as_deref() {
        None | Some("sqlite") => Ok(RuleSource::Sqlite),
        Some("file") => {
            let path = value(config, "rules", "file").ok_or_else(|| missing("rules", "file"))?;
            Ok(RuleSource::File {
                path: PathBuf::from(path),
            })
        }
        Some(other) => Err(invalid(
            "rules",
            "source",
            format!("unknown source '{}', expected 'sqlite' or 'file'", other),
        )),
    }
}

pub fn log_level(config: &dyn ConfigPort) -> Option<String> {
    value(config, "logging", "level")
}

/// Channels for newly opened alerts. Without a `[notify]` section alerts go
/// to the log only; `channels = none` turns notification off.
pub fn notify_channels(config: &dyn ConfigPort) -> Result<Vec<ChannelConfig>, QcwatchError> {
    let raw = value(config, "notify", "channels").unwrap_or_else(|| "log".to_string());
    let mut channels = Vec::new();
    for name in raw.split(',').map(|n| n.trim().to_lowercase()).filter(|n| !n.is_empty()) {
        let channel = match name.as_str() {
            "none" => continue,
            "log" => ChannelConfig::Log,
            "webhook" => {
                let url = value(config, "notify", "webhook_url")
                    .ok_or_else(|| missing("notify", "webhook_url"))?;
                let timeout_ms: u64 =
                    parsed(config, "notify", "webhook_timeout_ms", DEFAULT_WEBHOOK_TIMEOUT_MS)?;
                if timeout_ms == 0 {
                    return Err(invalid(
                        "notify",
                        "webhook_timeout_ms",
                        "webhook_timeout_ms must be at least 1",
                    ));
                }
                ChannelConfig::Webhook {
                    url,
                    timeout: Duration::from_millis(timeout_ms),
                }
            }
            other => {
                return Err(invalid(
                    "notify",
                    "channels",
                    format!("unknown channel '{}', expected 'log', 'webhook' or 'none'", other),
                ));
            }
        };
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    Ok(channels)
}
