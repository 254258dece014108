//! CLI definition and dispatch.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::log_notifier::LogNotifier;
use crate::adapters::memory_event_store::MemoryEventStore;
use crate::adapters::rule_file_adapter::RuleFileAdapter;
use crate::domain::config_validation::{
    build_engine_config, data_source, log_level, notify_channels, rule_source, ChannelConfig,
    DataSource, RuleSource,
};
use crate::domain::engine::{Engine, EngineConfig, EvaluationReport};
use crate::domain::error::QcwatchError;
use crate::domain::event::{AlertEvent, EventState};
use crate::domain::expression::{Expression, Variables};
use crate::domain::ledger::EventLedger;
use crate::domain::notification::Dispatcher;
use crate::domain::qc::{run_qc_report, QcReport, QcStatus};
use crate::domain::rule::{AlertRule, EXPRESSION_VARIABLES};
use crate::ports::config_port::ConfigPort;
use crate::ports::event_port::EventPort;
use crate::ports::notifier_port::NotifierPort;
use crate::ports::rule_port::RulePort;
use crate::ports::series_port::{SeriesPort, SeriesWindow};

#[cfg(feature = "sqlite")]
use crate::adapters::sqlite_adapter::SqliteAdapter;

/// Bars fetched per instrument for a QC report.
pub const QC_REPORT_OBSERVATIONS: usize = 250;

#[derive(Parser, Debug)]
#[command(name = "qcwatch", about = "Data-quality checks and alert rule evaluation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate every enabled rule once
    Evaluate {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Evaluation date (YYYY-MM-DD or RFC 3339); defaults to now
        #[arg(long)]
        as_of: Option<String>,
        /// Evaluate without writing events
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate rules repeatedly at a fixed interval
    Watch {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
        #[arg(long)]
        max_runs: Option<u64>,
    },
    /// Data-quality report for one or all instruments
    Qc {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        instrument: Option<String>,
        #[arg(long)]
        as_of: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List rule definitions and whether they validate
    Rules {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List alert events
    Events {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// OPEN, ACKNOWLEDGED or RESOLVED
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Acknowledge an open alert event
    Ack {
        event_id: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Resolve an alert event by hand
    Resolve {
        event_id: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Compile a custom expression and optionally evaluate it
    CheckExpr {
        expression: String,
        /// Variable binding, e.g. --var price=30
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// Load CSV series into the SQLite database
    Import {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        csv_dir: PathBuf,
        #[arg(long)]
        instrument: Option<String>,
        /// Also copy rules from an INI rule file
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Evaluate {
            config,
            as_of,
            dry_run,
            json,
        } => run_evaluate(config.as_deref(), as_of.as_deref(), dry_run, json),
        Command::Watch {
            config,
            interval_secs,
            max_runs,
        } => run_watch(config.as_deref(), Duration::from_secs(interval_secs), max_runs),
        Command::Qc {
            config,
            instrument,
            as_of,
            json,
        } => run_qc(config.as_deref(), instrument.as_deref(), as_of.as_deref(), json),
        Command::Rules { config } => run_rules(config.as_deref()),
        Command::Events {
            config,
            state,
            limit,
            json,
        } => run_events(config.as_deref(), state.as_deref(), limit, json),
        Command::Ack {
            event_id,
            config,
            note,
        } => run_ack(config.as_deref(), &event_id, note),
        Command::Resolve { event_id, config } => run_resolve(config.as_deref(), &event_id),
        Command::CheckExpr { expression, vars } => run_check_expr(&expression, &vars),
        Command::Import {
            config,
            csv_dir,
            instrument,
            rules,
        } => run_import(config.as_deref(), &csv_dir, instrument.as_deref(), rules.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<FileConfigAdapter, QcwatchError> {
    match path {
        Some(path) => FileConfigAdapter::from_file(path),
        None => Ok(FileConfigAdapter::empty()),
    }
}

/// Install the stderr tracing subscriber. `RUST_LOG` wins over the config.
pub fn init_logging(config: &dyn ConfigPort) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
        Err(_) => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(log_level(config).unwrap_or_default()),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp; `None` is now.
pub fn parse_as_of(raw: Option<&str>) -> Result<DateTime<Utc>, QcwatchError> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(Utc::now());
    };
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| QcwatchError::ConfigInvalid {
            section: "cli".into(),
            key: "as-of".into(),
            reason: format!("'{}' is neither YYYY-MM-DD nor RFC 3339", raw),
        })
}

/// The ports a command works against, wired from configuration.
pub struct Stack {
    pub series: Arc<dyn SeriesPort>,
    pub rules: Arc<dyn RulePort>,
    pub events: Arc<dyn EventPort>,
    pub engine: EngineConfig,
    pub channels: Vec<Arc<dyn NotifierPort>>,
}

#[cfg(feature = "sqlite")]
fn open_database(config: &dyn ConfigPort) -> Result<Arc<SqliteAdapter>, QcwatchError> {
    let db = SqliteAdapter::from_config(config)?;
    db.initialize_schema()?;
    Ok(Arc::new(db))
}

fn build_channels(config: &dyn ConfigPort) -> Result<Vec<Arc<dyn NotifierPort>>, QcwatchError> {
    notify_channels(config)?
        .into_iter()
        .map(|channel| -> Result<Arc<dyn NotifierPort>, QcwatchError> {
            match channel {
                ChannelConfig::Log => Ok(Arc::new(LogNotifier)),
                #[cfg(feature = "webhook")]
                ChannelConfig::Webhook { url, timeout } => Ok(Arc::new(
                    crate::adapters::webhook_notifier::WebhookNotifier::new(&url, timeout)?,
                )),
                #[cfg(not(feature = "webhook"))]
                ChannelConfig::Webhook { .. } => Err(QcwatchError::ConfigInvalid {
                    section: "notify".into(),
                    key: "channels".into(),
                    reason: "built without the webhook feature".into(),
                }),
            }
        })
        .collect()
}

pub fn build_stack(config: &dyn ConfigPort) -> Result<Stack, QcwatchError> {
    let engine = build_engine_config(config)?;
    let channels = build_channels(config)?;
    let data = data_source(config)?;
    let rules = rule_source(config)?;

    #[cfg(feature = "sqlite")]
    {
        let db = open_database(config)?;
        let series: Arc<dyn SeriesPort> = match data {
            DataSource::Sqlite => db.clone(),
            DataSource::Csv { dir } => Arc::new(CsvAdapter::new(dir)),
        };
        let rules: Arc<dyn RulePort> = match rules {
            RuleSource::Sqlite => db.clone(),
            RuleSource::File { path } => Arc::new(RuleFileAdapter::from_file(path)?),
        };
        Ok(Stack {
            series,
            rules,
            events: db,
            engine,
            channels,
        })
    }

    #[cfg(not(feature = "sqlite"))]
    {
        let sqlite_disabled = |section: &str| QcwatchError::ConfigInvalid {
            section: section.into(),
            key: "source".into(),
            reason: "built without the sqlite feature".into(),
        };
        let series: Arc<dyn SeriesPort> = match data {
            DataSource::Sqlite => return Err(sqlite_disabled("data")),
            DataSource::Csv { dir } => Arc::new(CsvAdapter::new(dir)),
        };
        let rules: Arc<dyn RulePort> = match rules {
            RuleSource::Sqlite => return Err(sqlite_disabled("rules")),
            RuleSource::File { path } => Arc::new(RuleFileAdapter::from_file(path)?),
        };
        Ok(Stack {
            series,
            rules,
            events: Arc::new(MemoryEventStore::new()),
            engine,
            channels,
        })
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), QcwatchError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_json(report: &EvaluationReport) -> serde_json::Value {
    serde_json::json!({
        "as_of": report.as_of,
        "evaluated": report.evaluated,
        "events_opened": report.events_opened,
        "events_updated": report.events_updated,
        "events_resolved": report.events_resolved,
        "failures": report.failure_summaries(),
        "notifications": report.notifications,
    })
}

/// Human-readable run summary, one line per event or failure.
pub fn format_report(report: &EvaluationReport) -> String {
    let mut out = format!(
        "as of {}: {} rules evaluated, {} opened, {} updated, {} resolved, {} failed\n",
        report.as_of.to_rfc3339(),
        report.evaluated,
        report.events_opened.len(),
        report.events_updated.len(),
        report.events_resolved.len(),
        report.failures.len()
    );
    let sections = [
        ("OPENED", &report.events_opened),
        ("UPDATED", &report.events_updated),
        ("RESOLVED", &report.events_resolved),
    ];
    for (label, events) in sections {
        for e in events.iter() {
            out.push_str(&format!(
                "  {:<9}{:<20}{:<10}{}\n",
                label, e.rule_id, e.instrument_id, e.message
            ));
        }
    }
    for f in &report.failures {
        out.push_str(&format!(
            "  {:<9}{:<20}{:<10}{}: {}\n",
            "FAILED",
            f.rule_id,
            f.instrument_id,
            f.error.kind(),
            f.error
        ));
    }
    if !report.notifications.is_empty() {
        let delivered = report.notifications.iter().filter(|r| r.success).count();
        out.push_str(&format!(
            "notifications: {} delivered, {} failed\n",
            delivered,
            report.notifications.len() - delivered
        ));
        for r in report.notifications.iter().filter(|r| !r.success) {
            out.push_str(&format!(
                "  {:<9}{:<20}{:<10}{}\n",
                "UNSENT",
                r.notification.rule_id,
                r.channel,
                r.error.as_deref().unwrap_or("")
            ));
        }
    }
    out
}

pub fn run_evaluate(
    config_path: Option<&Path>,
    as_of: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let as_of = parse_as_of(as_of)?;
    let stack = build_stack(&config)?;

    let sink: Arc<dyn EventPort> = if dry_run {
        Arc::new(MemoryEventStore::with_events(stack.events.load_active_events()?))
    } else {
        stack.events.clone()
    };
    let ledger = Arc::new(EventLedger::load(sink, as_of)?);
    let mut engine = Engine::new(stack.series.clone(), ledger, stack.engine.clone())?;
    if !dry_run {
        engine = engine.with_notifier(Arc::new(Dispatcher::new(stack.channels.clone())));
    }
    let report = engine.run_from_store(stack.rules.as_ref(), as_of)?;

    if json {
        print_json(&report_json(&report))
    } else {
        print!("{}", format_report(&report));
        Ok(())
    }
}

fn run_watch(
    config_path: Option<&Path>,
    interval: Duration,
    max_runs: Option<u64>,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let stack = build_stack(&config)?;

    let ledger = Arc::new(EventLedger::load(stack.events.clone(), Utc::now())?);
    let engine = Engine::new(stack.series.clone(), ledger, stack.engine.clone())?
        .with_notifier(Arc::new(Dispatcher::new(stack.channels.clone())));
    let stats = engine.watch(stack.rules.as_ref(), interval, max_runs);
    print_json(&stats)
}

/// QC reports for `instrument`, or for every instrument the series port knows.
pub fn qc_reports(
    series: &dyn SeriesPort,
    engine: &EngineConfig,
    instrument: Option<&str>,
    as_of: NaiveDate,
) -> Result<Vec<QcReport>, QcwatchError> {
    let instruments = match instrument {
        Some(id) => vec![id.to_string()],
        None => series.list_instruments()?,
    };
    let window = SeriesWindow::new(as_of, QC_REPORT_OBSERVATIONS);
    instruments
        .iter()
        .map(|id| {
            let s = series.get_series(id, window)?;
            Ok(run_qc_report(&s, &engine.qc, as_of))
        })
        .collect()
}

fn run_qc(
    config_path: Option<&Path>,
    instrument: Option<&str>,
    as_of: Option<&str>,
    json: bool,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let as_of = parse_as_of(as_of)?.date_naive();
    let stack = build_stack(&config)?;
    let reports = qc_reports(stack.series.as_ref(), &stack.engine, instrument, as_of)?;

    if json {
        return print_json(&reports);
    }
    for r in &reports {
        let status = match r.status {
            QcStatus::Passed => "PASSED",
            QcStatus::Failed => "FAILED",
        };
        println!(
            "{:<10} {:<6} bars={} missing_pct={:.2}% missing_days={} stale={}d outliers={} max_gap={}d",
            r.instrument_id,
            status,
            r.total_bars,
            r.signal.missing_pct * 100.0,
            r.missing_days,
            r.signal.days_stale,
            r.signal.outlier_flags.len(),
            r.max_gap_days
        );
    }
    Ok(())
}

fn run_rules(config_path: Option<&Path>) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let stack = build_stack(&config)?;
    for def in stack.rules.list_rules()? {
        let status = if !def.enabled {
            "disabled".to_string()
        } else {
            match AlertRule::from_definition(&def) {
                Ok(_) => "ok".to_string(),
                Err(e) => format!("invalid: {}", e),
            }
        };
        println!(
            "{:<20} {:<10} {:<18} {:<7} {}",
            def.id, def.instrument_id, def.rule_type, def.severity, status
        );
    }
    Ok(())
}

fn print_event(e: &AlertEvent) {
    println!(
        "{}  {:<12} {:<20} {:<10} {:<6} {}",
        e.id,
        e.state,
        e.rule_id,
        e.instrument_id,
        e.severity,
        e.message
    );
}

fn run_events(
    config_path: Option<&Path>,
    state: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let state = state
        .map(|s| {
            s.parse::<EventState>()
                .map_err(|reason| QcwatchError::ConfigInvalid {
                    section: "cli".into(),
                    key: "state".into(),
                    reason,
                })
        })
        .transpose()?;
    let stack = build_stack(&config)?;
    let events = stack.events.list_events(state, limit)?;
    if json {
        return print_json(&events);
    }
    events.iter().for_each(print_event);
    Ok(())
}

fn run_ack(
    config_path: Option<&Path>,
    event_id: &str,
    note: Option<String>,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let stack = build_stack(&config)?;
    let ledger = EventLedger::load(stack.events.clone(), Utc::now())?;
    print_event(&ledger.acknowledge(event_id, note)?);
    Ok(())
}

fn run_resolve(config_path: Option<&Path>, event_id: &str) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let stack = build_stack(&config)?;
    let now = Utc::now();
    let ledger = EventLedger::load(stack.events.clone(), now)?;
    print_event(&ledger.resolve(event_id, now)?);
    Ok(())
}

/// Parse `name=value` bindings for `check-expr`.
pub fn parse_vars(raw: &[String]) -> Result<Variables, QcwatchError> {
    raw.iter()
        .map(|binding| {
            let invalid = |reason: String| QcwatchError::ConfigInvalid {
                section: "cli".into(),
                key: "var".into(),
                reason,
            };
            let (name, value) = binding
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected name=value, got '{}'", binding)))?;
            let value = value
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid(format!("'{}' is not a number", value.trim())))?;
            Ok((name.trim().to_string(), value))
        })
        .collect()
}

/// Compile against the rule namespace (threshold included). With bindings,
/// also evaluate and return the result.
pub fn check_expression(source: &str, vars: &Variables) -> Result<Option<bool>, QcwatchError> {
    let mut allowed: Vec<&str> = EXPRESSION_VARIABLES.to_vec();
    allowed.push("threshold");
    let expression = Expression::compile(source, &allowed)?;
    if vars.is_empty() {
        return Ok(None);
    }
    Ok(Some(expression.evaluate(vars)?))
}

fn run_check_expr(source: &str, raw_vars: &[String]) -> Result<(), QcwatchError> {
    let vars = parse_vars(raw_vars)?;
    match check_expression(source, &vars) {
        Ok(None) => println!("ok"),
        Ok(Some(result)) => println!("{}", result),
        Err(QcwatchError::Expression(e)) => {
            eprintln!("{}", e.display_with_context(source));
            return Err(QcwatchError::Expression(e));
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
fn run_import(
    config_path: Option<&Path>,
    csv_dir: &Path,
    instrument: Option<&str>,
    rules_file: Option<&Path>,
) -> Result<(), QcwatchError> {
    let config = load_config(config_path)?;
    init_logging(&config);
    let db = open_database(&config)?;
    let csv = CsvAdapter::new(csv_dir.to_path_buf());

    let instruments = match instrument {
        Some(id) => vec![id.to_string()],
        None => csv.list_instruments()?,
    };
    let everything = SeriesWindow::new(NaiveDate::MAX, usize::MAX);
    for id in &instruments {
        let series = csv.get_series(id, everything)?;
        db.insert_bars(id, series.bars())?;
        println!("imported {} bars for {}", series.len(), id);
    }

    if let Some(path) = rules_file {
        let file = RuleFileAdapter::from_file(path)?;
        let rules = file.list_rules()?;
        for rule in &rules {
            db.upsert_rule(rule)?;
        }
        println!("imported {} rules", rules.len());
    }
    Ok(())
}

#[cfg(not(feature = "sqlite"))]
fn run_import(
    _config_path: Option<&Path>,
    _csv_dir: &Path,
    _instrument: Option<&str>,
    _rules_file: Option<&Path>,
) -> Result<(), QcwatchError> {
    Err(QcwatchError::ConfigInvalid {
        section: "sqlite".into(),
        key: "path".into(),
        reason: "built without the sqlite feature".into(),
    })
}
