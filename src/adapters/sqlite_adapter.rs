//! SQLite adapter: series, rule store and event sink in one database.

use crate::domain::config_validation::{sqlite_path, sqlite_pool_size};
use crate::domain::error::QcwatchError;
use crate::domain::event::{AlertEvent, EventState};
use crate::domain::rule::{RuleDefinition, Severity};
use crate::domain::series::{Bar, Series};
use crate::ports::config_port::ConfigPort;
use crate::ports::event_port::EventPort;
use crate::ports::rule_port::RulePort;
use crate::ports::series_port::{SeriesPort, SeriesWindow};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS series_daily (
    instrument_id TEXT NOT NULL,
    date TEXT NOT NULL,
    value REAL,
    volume INTEGER,
    PRIMARY KEY (instrument_id, date)
);
CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    instrument_id TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '{}',
    severity TEXT NOT NULL DEFAULT 'medium',
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS alert_events (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    instrument_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    state TEXT NOT NULL,
    last_observed_value REAL,
    last_seen_at TEXT NOT NULL,
    ack_note TEXT,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_alert_events_rule_state ON alert_events(rule_id, state);
CREATE UNIQUE INDEX IF NOT EXISTS idx_alert_events_one_active
    ON alert_events(rule_id) WHERE state IN ('OPEN', 'ACKNOWLEDGED');
CREATE INDEX IF NOT EXISTS idx_alert_events_opened ON alert_events(opened_at);";

const EVENT_COLUMNS: &str = "id, rule_id, instrument_id, severity, message, opened_at, state,
     last_observed_value, last_seen_at, ack_note, resolved_at";

fn pool_error(e: r2d2::Error) -> QcwatchError {
    QcwatchError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: rusqlite::Error) -> QcwatchError {
    QcwatchError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conversion_error(
    column: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into())
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let severity: String = row.get(3)?;
    let opened_at: String = row.get(5)?;
    let state: String = row.get(6)?;
    let last_seen_at: String = row.get(8)?;
    let resolved_at: Option<String> = row.get(10)?;

    Ok(AlertEvent {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        instrument_id: row.get(2)?,
        severity: severity
            .parse::<Severity>()
            .map_err(|e| conversion_error(3, e))?,
        message: row.get(4)?,
        opened_at: parse_timestamp(5, &opened_at)?,
        state: state
            .parse::<EventState>()
            .map_err(|e| conversion_error(6, e))?,
        last_observed_value: row.get(7)?,
        last_seen_at: parse_timestamp(8, &last_seen_at)?,
        ack_note: row.get(9)?,
        resolved_at: resolved_at
            .as_deref()
            .map(|raw| parse_timestamp(10, raw))
            .transpose()?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RuleDefinition> {
    let parameters: String = row.get(4)?;
    let parameters: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&parameters).map_err(|e| conversion_error(4, e))?;
    Ok(RuleDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        instrument_id: row.get(2)?,
        rule_type: row.get(3)?,
        // Parameters may be stored as JSON numbers or strings.
        parameters: parameters
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        severity: row.get(5)?,
        enabled: row.get(6)?,
    })
}

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QcwatchError> {
        let path = sqlite_path(config);
        let pool_size = sqlite_pool_size(config)?;
        Self::open(&path, pool_size)
    }

    pub fn open(path: &Path, pool_size: u32) -> Result<Self, QcwatchError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_error)?;
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, QcwatchError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_error)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, QcwatchError> {
        self.pool.get().map_err(pool_error)
    }

    pub fn initialize_schema(&self) -> Result<(), QcwatchError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_error)
    }

    pub fn insert_bars(&self, instrument_id: &str, bars: &[Bar]) -> Result<(), QcwatchError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_error)?;
        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO series_daily (instrument_id, date, value, volume)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    instrument_id,
                    bar.date.format("%Y-%m-%d").to_string(),
                    bar.value.is_finite().then_some(bar.value),
                    bar.volume
                ],
            )
            .map_err(query_error)?;
        }
        tx.commit().map_err(query_error)
    }

    pub fn upsert_rule(&self, rule: &RuleDefinition) -> Result<(), QcwatchError> {
        let parameters = serde_json::to_string(&rule.parameters)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO alert_rules
                 (id, name, instrument_id, rule_type, parameters, severity, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule.id,
                    rule.name,
                    rule.instrument_id,
                    rule.rule_type,
                    parameters,
                    rule.severity,
                    rule.enabled
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn query_rules(&self, only_enabled: bool) -> Result<Vec<RuleDefinition>, QcwatchError> {
        let conn = self.conn()?;
        let query = if only_enabled {
            "SELECT id, name, instrument_id, rule_type, parameters, severity, enabled
             FROM alert_rules WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT id, name, instrument_id, rule_type, parameters, severity, enabled
             FROM alert_rules ORDER BY id"
        };
        let mut stmt = conn.prepare(query).map_err(query_error)?;
        let rows = stmt.query_map([], rule_from_row).map_err(query_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_error)
    }

    fn query_events(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<AlertEvent>, QcwatchError> {
        let conn = self.conn()?;
        let query = format!("SELECT {} FROM alert_events {}", EVENT_COLUMNS, filter);
        let mut stmt = conn.prepare(&query).map_err(query_error)?;
        let rows = stmt.query_map(args, event_from_row).map_err(query_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_error)
    }
}

impl SeriesPort for SqliteAdapter {
    fn get_series(&self, instrument_id: &str, window: SeriesWindow) -> Result<Series, QcwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT date, value, volume FROM series_daily
                 WHERE instrument_id = ?1 AND date <= ?2
                 ORDER BY date DESC
                 LIMIT ?3",
            )
            .map_err(query_error)?;

        let rows = stmt
            .query_map(
                params![
                    instrument_id,
                    window.end.format("%Y-%m-%d").to_string(),
                    window.observations as i64
                ],
                |row| {
                    let date_str: String = row.get(0)?;
                    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                        .map_err(|e| conversion_error(0, e))?;
                    let value: Option<f64> = row.get(1)?;
                    Ok(Bar {
                        date,
                        value: value.unwrap_or(f64::NAN),
                        volume: row.get(2)?,
                    })
                },
            )
            .map_err(query_error)?;

        let mut bars = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_error)?;
        if bars.is_empty() {
            return Err(QcwatchError::DataUnavailable {
                instrument_id: instrument_id.to_string(),
            });
        }
        bars.reverse();
        Series::new(instrument_id, bars)
    }

    fn list_instruments(&self) -> Result<Vec<String>, QcwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT instrument_id FROM series_daily ORDER BY instrument_id")
            .map_err(query_error)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(query_error)?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(query_error)
    }
}

impl RulePort for SqliteAdapter {
    fn list_enabled_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError> {
        self.query_rules(true)
    }

    fn list_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError> {
        self.query_rules(false)
    }
}

impl EventPort for SqliteAdapter {
    fn upsert_event(&self, event: &AlertEvent) -> Result<(), QcwatchError> {
        self.conn()?
            .execute(
                // ON CONFLICT(id) so the one-active-per-rule index still aborts
                "INSERT INTO alert_events
                 (id, rule_id, instrument_id, severity, message, opened_at, state,
                  last_observed_value, last_seen_at, ack_note, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    rule_id = excluded.rule_id,
                    instrument_id = excluded.instrument_id,
                    severity = excluded.severity,
                    message = excluded.message,
                    opened_at = excluded.opened_at,
                    state = excluded.state,
                    last_observed_value = excluded.last_observed_value,
                    last_seen_at = excluded.last_seen_at,
                    ack_note = excluded.ack_note,
                    resolved_at = excluded.resolved_at",
                params![
                    event.id,
                    event.rule_id,
                    event.instrument_id,
                    event.severity.to_string(),
                    event.message,
                    timestamp(&event.opened_at),
                    event.state.as_str(),
                    event.last_observed_value,
                    timestamp(&event.last_seen_at),
                    event.ack_note,
                    event.resolved_at.as_ref().map(timestamp),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    QcwatchError::ActiveEventConflict {
                        rule_id: event.rule_id.clone(),
                        event_id: event.id.clone(),
                    }
                } else {
                    query_error(e)
                }
            })?;
        Ok(())
    }

    fn load_active_events(&self) -> Result<Vec<AlertEvent>, QcwatchError> {
        self.query_events(
            "WHERE state IN ('OPEN', 'ACKNOWLEDGED') ORDER BY opened_at, id",
            [],
        )
    }

    fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>, QcwatchError> {
        let conn = self.conn()?;
        let query = format!("SELECT {} FROM alert_events WHERE id = ?1", EVENT_COLUMNS);
        conn.query_row(&query, params![event_id], event_from_row)
            .optional()
            .map_err(query_error)
    }

    fn active_event_for_rule(&self, rule_id: &str) -> Result<Option<AlertEvent>, QcwatchError> {
        let mut events = self.query_events(
            "WHERE rule_id = ?1 AND state IN ('OPEN', 'ACKNOWLEDGED')
             ORDER BY opened_at DESC, id DESC LIMIT 1",
            params![rule_id],
        )?;
        Ok(events.pop())
    }

    fn list_events(
        &self,
        state: Option<EventState>,
        limit: Option<usize>,
    ) -> Result<Vec<AlertEvent>, QcwatchError> {
        // LIMIT -1 is unbounded in SQLite.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.query_events(
            "WHERE (?1 IS NULL OR state = ?1) ORDER BY opened_at DESC, id LIMIT ?2",
            params![state.map(EventState::as_str), limit],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn event(id: &str, day: u32, state: EventState) -> AlertEvent {
        event_for("r1", id, day, state)
    }

    fn event_for(rule_id: &str, id: &str, day: u32, state: EventState) -> AlertEvent {
        let at = Utc.with_ymd_and_hms(2024, 1, day, 18, 30, 0).unwrap();
        AlertEvent {
            id: id.into(),
            rule_id: rule_id.into(),
            instrument_id: "TTF".into(),
            severity: Severity::High,
            message: "TTF price 30".into(),
            opened_at: at,
            state,
            last_observed_value: Some(30.0),
            last_seen_at: at,
            ack_note: None,
            resolved_at: (state == EventState::Resolved).then_some(at),
        }
    }

    #[test]
    fn from_config_rejects_zero_pool() {
        struct ZeroPool;
        impl ConfigPort for ZeroPool {
            fn get_string(&self, section: &str, key: &str) -> Option<String> {
                (section == "sqlite" && key == "pool_size").then(|| "0".to_string())
            }
        }
        assert!(matches!(
            SqliteAdapter::from_config(&ZeroPool),
            Err(QcwatchError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn open_creates_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("qcwatch.db");
        let adapter = SqliteAdapter::open(&path, 2).unwrap();
        adapter.initialize_schema().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn get_series_returns_last_bars_up_to_end() {
        let adapter = adapter();
        let bars: Vec<Bar> = (1..=10).map(|day| Bar::new(d(day), day as f64)).collect();
        adapter.insert_bars("TTF", &bars).unwrap();

        let series = adapter.get_series("TTF", SeriesWindow::new(d(8), 3)).unwrap();
        assert_eq!(series.values(), vec![6.0, 7.0, 8.0]);
        assert_eq!(series.last_date(), Some(d(8)));
    }

    #[test]
    fn non_finite_values_round_trip_as_nan() {
        let adapter = adapter();
        adapter
            .insert_bars("TTF", &[Bar::new(d(1), 1.0), Bar::new(d(2), f64::NAN)])
            .unwrap();
        let series = adapter.get_series("TTF", SeriesWindow::new(d(2), 5)).unwrap();
        assert!(series.latest().unwrap().value.is_nan());
    }

    #[test]
    fn unknown_instrument_is_unavailable() {
        let adapter = adapter();
        assert!(matches!(
            adapter.get_series("NOPE", SeriesWindow::new(d(1), 5)),
            Err(QcwatchError::DataUnavailable { .. })
        ));
    }

    #[test]
    fn list_instruments_is_sorted() {
        let adapter = adapter();
        adapter.insert_bars("TTF", &[Bar::new(d(1), 1.0)]).unwrap();
        adapter.insert_bars("HH", &[Bar::new(d(1), 1.0)]).unwrap();
        assert_eq!(adapter.list_instruments().unwrap(), vec!["HH", "TTF"]);
    }

    #[test]
    fn rules_round_trip_with_parameters() {
        let adapter = adapter();
        let rule = RuleDefinition::new("r1", "TTF", "correlation_break")
            .with_param("reference", "NBP")
            .with_param("min_correlation", 0.4);
        let mut disabled = RuleDefinition::new("r2", "TTF", "staleness").with_param("threshold", 3);
        disabled.enabled = false;
        adapter.upsert_rule(&rule).unwrap();
        adapter.upsert_rule(&disabled).unwrap();

        let enabled = adapter.list_enabled_rules().unwrap();
        assert_eq!(enabled, vec![rule]);
        assert_eq!(adapter.list_rules().unwrap().len(), 2);
    }

    #[test]
    fn numeric_json_parameters_are_accepted() {
        let adapter = adapter();
        adapter
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO alert_rules (id, name, instrument_id, rule_type, parameters)
                 VALUES ('r1', 'spike', 'TTF', 'zscore', '{\"threshold\": 2.5, \"lookback\": 20}')",
                [],
            )
            .unwrap();
        let rules = adapter.list_enabled_rules().unwrap();
        assert_eq!(rules[0].parameters.get("threshold").map(String::as_str), Some("2.5"));
        assert_eq!(rules[0].severity, "medium");
    }

    #[test]
    fn events_upsert_is_idempotent() {
        let adapter = adapter();
        let e = event("a", 1, EventState::Open);
        adapter.upsert_event(&e).unwrap();
        adapter.upsert_event(&e).unwrap();
        assert_eq!(adapter.list_events(None, None).unwrap(), vec![e.clone()]);
        assert_eq!(adapter.get_event("a").unwrap(), Some(e));
        assert_eq!(adapter.get_event("missing").unwrap(), None);
    }

    #[test]
    fn active_events_and_filters() {
        let adapter = adapter();
        adapter.upsert_event(&event("a", 1, EventState::Resolved)).unwrap();
        adapter.upsert_event(&event("b", 2, EventState::Acknowledged)).unwrap();
        adapter.upsert_event(&event_for("r2", "c", 3, EventState::Open)).unwrap();

        let active: Vec<String> = adapter
            .load_active_events()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec!["b", "c"]);

        let resolved = adapter.list_events(Some(EventState::Resolved), None).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_at, resolved[0].opened_at.into());

        let newest = adapter.list_events(None, Some(2)).unwrap();
        assert_eq!(
            newest.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
    }

    #[test]
    fn second_active_event_for_a_rule_is_rejected() {
        let adapter = adapter();
        adapter.upsert_event(&event("a", 1, EventState::Open)).unwrap();

        match adapter.upsert_event(&event("b", 2, EventState::Open)) {
            Err(QcwatchError::ActiveEventConflict { rule_id, event_id }) => {
                assert_eq!(rule_id, "r1");
                assert_eq!(event_id, "b");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(adapter.get_event("a").unwrap().unwrap().state, EventState::Open);
        assert_eq!(adapter.get_event("b").unwrap(), None);

        // once the first is resolved the rule may open again
        adapter.upsert_event(&event("a", 1, EventState::Resolved)).unwrap();
        adapter.upsert_event(&event("b", 2, EventState::Open)).unwrap();
        assert_eq!(adapter.active_event_for_rule("r1").unwrap().unwrap().id, "b");
        assert_eq!(adapter.active_event_for_rule("r2").unwrap(), None);
    }
}
