//! CLI integration tests for command orchestration.
//!
//! Tests cover:
//! - Argument parsing for the subcommands
//! - `--as-of` and `--var` parsing
//! - Expression checking against the rule namespace
//! - QC reports and run summaries with MockSeriesPort
//! - Evaluate with real INI, CSV and SQLite files on disk (normal and dry run)

mod common;

use clap::Parser;
use common::*;
use qcwatch::adapters::file_config_adapter::FileConfigAdapter;
use qcwatch::adapters::memory_event_store::MemoryEventStore;
use qcwatch::cli::{self, Cli, Command};
use qcwatch::domain::engine::{Engine, EngineConfig};
use qcwatch::domain::error::QcwatchError;
use qcwatch::domain::ledger::EventLedger;
use qcwatch::domain::qc::QcStatus;
use qcwatch::domain::rule::RuleDefinition;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

mod argument_parsing {
    use super::*;

    #[test]
    fn evaluate_flags() {
        let cli = Cli::try_parse_from([
            "qcwatch", "evaluate", "-c", "qc.ini", "--as-of", "2024-01-03", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::Evaluate {
                config,
                as_of,
                dry_run,
                json,
            } => {
                assert_eq!(config.unwrap().to_str(), Some("qc.ini"));
                assert_eq!(as_of.as_deref(), Some("2024-01-03"));
                assert!(dry_run);
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn check_expr_collects_vars() {
        let cli = Cli::try_parse_from([
            "qcwatch", "check-expr", "price > 3", "--var", "price=4", "--var", "z=1",
        ])
        .unwrap();
        match cli.command {
            Command::CheckExpr { expression, vars } => {
                assert_eq!(expression, "price > 3");
                assert_eq!(vars, vec!["price=4", "z=1"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn watch_defaults_interval() {
        let cli = Cli::try_parse_from(["qcwatch", "watch", "--max-runs", "2"]).unwrap();
        match cli.command {
            Command::Watch {
                interval_secs,
                max_runs,
                ..
            } => {
                assert_eq!(interval_secs, 300);
                assert_eq!(max_runs, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ack_requires_event_id() {
        assert!(Cli::try_parse_from(["qcwatch", "ack"]).is_err());
    }
}

mod input_parsing {
    use super::*;

    #[test]
    fn as_of_accepts_plain_date_as_midnight_utc() {
        let t = cli::parse_as_of(Some("2024-01-05")).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-05T00:00:00+00:00");
    }

    #[test]
    fn as_of_accepts_rfc3339_with_offset() {
        let t = cli::parse_as_of(Some("2024-01-05T09:30:00+02:00")).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-05T07:30:00+00:00");
    }

    #[test]
    fn as_of_rejects_garbage() {
        match cli::parse_as_of(Some("last tuesday")) {
            Err(QcwatchError::ConfigInvalid { section, key, .. }) => {
                assert_eq!(section, "cli");
                assert_eq!(key, "as-of");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn vars_parse_name_value_pairs() {
        let vars = cli::parse_vars(&["price = 30".to_string(), "z=-1.5".to_string()]).unwrap();
        assert_eq!(vars.get("price"), Some(&30.0));
        assert_eq!(vars.get("z"), Some(&-1.5));
    }

    #[test]
    fn vars_reject_malformed_bindings() {
        assert!(cli::parse_vars(&["price".to_string()]).is_err());
        assert!(cli::parse_vars(&["price=high".to_string()]).is_err());
    }
}

mod expression_checking {
    use super::*;

    #[test]
    fn compiles_without_bindings() {
        let result = cli::check_expression("z > threshold or days_stale >= 3", &Default::default());
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn evaluates_with_bindings() {
        let vars = cli::parse_vars(&["price=30".to_string(), "threshold=25".to_string()]).unwrap();
        assert_eq!(cli::check_expression("price > threshold", &vars).unwrap(), Some(true));
    }

    #[test]
    fn rejects_names_outside_namespace() {
        assert!(matches!(
            cli::check_expression("open_interest > 3", &Default::default()),
            Err(QcwatchError::Expression(_))
        ));
        assert!(matches!(
            cli::check_expression("__import__('os').system('ls')", &Default::default()),
            Err(QcwatchError::Expression(_))
        ));
    }

    #[test]
    fn unbound_variable_fails_at_evaluation() {
        let vars = cli::parse_vars(&["price=30".to_string()]).unwrap();
        assert!(cli::check_expression("price > threshold", &vars).is_err());
    }
}

mod qc_reports {
    use super::*;

    fn port() -> MockSeriesPort {
        MockSeriesPort::new()
            .with_values("TTF", "2024-01-01", &[30.0, 31.0, 32.0])
            .with_values("NBP", "2024-01-01", &[50.0, 51.0])
    }

    #[test]
    fn all_instruments_when_none_given() {
        let reports =
            cli::qc_reports(&port(), &EngineConfig::default(), None, date(2024, 1, 3)).unwrap();
        let ids: Vec<&str> = reports.iter().map(|r| r.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["NBP", "TTF"]);
        assert_eq!(reports[1].total_bars, 3);
        assert_eq!(reports[1].status, QcStatus::Passed);
    }

    #[test]
    fn single_instrument() {
        let reports = cli::qc_reports(
            &port(),
            &EngineConfig::default(),
            Some("NBP"),
            date(2024, 1, 3),
        )
        .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].signal.days_stale, 1.0);
    }

    #[test]
    fn unknown_instrument_is_an_error() {
        let result = cli::qc_reports(
            &port(),
            &EngineConfig::default(),
            Some("JKM"),
            date(2024, 1, 3),
        );
        assert!(matches!(result, Err(QcwatchError::DataUnavailable { .. })));
    }
}

mod run_summary {
    use super::*;

    #[test]
    fn summary_lists_events_and_failures() {
        let port = MockSeriesPort::new().with_values("TTF", "2024-01-01", &[30.0]);
        let ledger = Arc::new(EventLedger::new(Arc::new(MemoryEventStore::new())));
        let engine = Engine::new(Arc::new(port), ledger, EngineConfig::default()).unwrap();
        let rules = vec![
            RuleDefinition::new("ttf-spike", "TTF", "price_threshold").with_param("threshold", 25),
            RuleDefinition::new("jkm-spike", "JKM", "price_threshold").with_param("threshold", 25),
        ];
        let report = engine.run_evaluation(&rules, at("2024-01-01"));

        let text = cli::format_report(&report);
        assert!(text.contains("2 rules evaluated, 1 opened, 0 updated, 0 resolved, 1 failed"));
        let opened = text.lines().find(|l| l.contains("OPENED")).unwrap();
        assert!(opened.contains("ttf-spike"));
        let failed = text.lines().find(|l| l.contains("FAILED")).unwrap();
        assert!(failed.contains("jkm-spike"));
        assert!(failed.contains("data_unavailable"));
        assert!(!text.contains("notifications:"));
    }

    #[test]
    fn summary_counts_notification_deliveries() {
        use qcwatch::domain::notification::{Dispatcher, Notification};
        use qcwatch::ports::notifier_port::NotifierPort;

        struct DownChannel;
        impl NotifierPort for DownChannel {
            fn send(&self, _notification: &Notification) -> Result<(), QcwatchError> {
                Err(QcwatchError::Notification {
                    channel: "webhook".into(),
                    reason: "503".into(),
                })
            }
            fn channel_name(&self) -> &str {
                "webhook"
            }
        }

        let port = MockSeriesPort::new().with_values("TTF", "2024-01-01", &[30.0]);
        let ledger = Arc::new(EventLedger::new(Arc::new(MemoryEventStore::new())));
        let channels: Vec<Arc<dyn NotifierPort>> = vec![
            Arc::new(qcwatch::adapters::log_notifier::LogNotifier),
            Arc::new(DownChannel),
        ];
        let engine = Engine::new(Arc::new(port), ledger, EngineConfig::default())
            .unwrap()
            .with_notifier(Arc::new(Dispatcher::new(channels)));
        let rules =
            vec![RuleDefinition::new("ttf-spike", "TTF", "price_threshold").with_param("threshold", 25)];
        let report = engine.run_evaluation(&rules, at("2024-01-01"));

        let text = cli::format_report(&report);
        assert!(text.contains("notifications: 1 delivered, 1 failed"));
        let unsent = text.lines().find(|l| l.contains("UNSENT")).unwrap();
        assert!(unsent.contains("ttf-spike"));
        assert!(unsent.contains("webhook"));
    }
}

mod config_loading {
    use super::*;

    #[test]
    fn missing_config_path_falls_back_to_defaults() {
        let config = cli::load_config(None).unwrap();
        let engine = qcwatch::domain::config_validation::build_engine_config(&config).unwrap();
        assert_eq!(engine.qc, EngineConfig::default().qc);
    }

    #[test]
    fn missing_config_file_fails() {
        let result = cli::load_config(Some(Path::new("/nonexistent/qcwatch.ini")));
        assert!(matches!(result, Err(QcwatchError::ConfigParse { .. })));
    }

    #[test]
    fn invalid_engine_section_fails_before_any_run() {
        let file = write_temp_ini("[engine]\nseries_timeout_ms = soon\n");
        let config = FileConfigAdapter::from_file(file.path()).unwrap();
        assert!(matches!(
            cli::build_stack(&config),
            Err(QcwatchError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn webhook_channel_without_url_fails_before_any_run() {
        let file = write_temp_ini("[notify]\nchannels = log, webhook\n");
        let config = FileConfigAdapter::from_file(file.path()).unwrap();
        assert!(matches!(
            cli::build_stack(&config),
            Err(QcwatchError::ConfigMissing { .. })
        ));
    }
}

#[cfg(feature = "sqlite")]
mod evaluate_on_disk {
    use super::*;
    use qcwatch::adapters::sqlite_adapter::SqliteAdapter;
    use qcwatch::domain::event::EventState;
    use qcwatch::ports::event_port::EventPort;
    use std::fs;
    use tempfile::TempDir;

    const RULES: &str = r#"
[rule:ttf-spike]
instrument = TTF
type = price_threshold
operator = >
threshold = 25
severity = high

[rule:ttf-stale]
instrument = TTF
type = staleness
threshold = 5

[rule:nbp-spike]
instrument = NBP
type = price_threshold
threshold = 1
"#;

    /// Temp workspace with CSV data, a rule file and a config pointing at both.
    fn workspace() -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let data = root.join("data");
        fs::create_dir(&data).unwrap();
        fs::write(
            data.join("TTF.csv"),
            "date,value\n2024-01-01,10\n2024-01-02,20\n2024-01-03,30\n",
        )
        .unwrap();
        fs::write(root.join("rules.ini"), RULES).unwrap();

        let config = format!(
            "[sqlite]\npath = {}\n\n[data]\nsource = csv\ncsv_dir = {}\n\n[rules]\nsource = file\nfile = {}\n\n[engine]\nworkers = 2\n",
            root.join("qcwatch.db").display(),
            data.display(),
            root.join("rules.ini").display()
        );
        let config_path = root.join("qcwatch.ini");
        fs::write(&config_path, config).unwrap();
        (dir, config_path)
    }

    fn stored_events(dir: &TempDir) -> SqliteAdapter {
        SqliteAdapter::open(&dir.path().join("qcwatch.db"), 1).unwrap()
    }

    #[test]
    fn evaluate_persists_opened_events() {
        let (dir, config_path) = workspace();
        cli::run_evaluate(Some(&config_path), Some("2024-01-03"), false, true).unwrap();

        let db = stored_events(&dir);
        let active = db.load_active_events().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "ttf-spike");
        assert_eq!(active[0].state, EventState::Open);
    }

    #[test]
    fn second_run_refreshes_instead_of_duplicating() {
        let (dir, config_path) = workspace();
        cli::run_evaluate(Some(&config_path), Some("2024-01-03"), false, false).unwrap();
        cli::run_evaluate(Some(&config_path), Some("2024-01-03T20:00:00Z"), false, false).unwrap();

        let db = stored_events(&dir);
        let all = db.list_events(None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_seen_at.to_rfc3339(), "2024-01-03T20:00:00+00:00");
    }

    #[test]
    fn stale_data_opens_staleness_alert() {
        let (dir, config_path) = workspace();
        cli::run_evaluate(Some(&config_path), Some("2024-01-10"), false, false).unwrap();

        let db = stored_events(&dir);
        let mut rules: Vec<String> = db
            .load_active_events()
            .unwrap()
            .into_iter()
            .map(|e| e.rule_id)
            .collect();
        rules.sort();
        assert_eq!(rules, vec!["ttf-spike", "ttf-stale"]);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let (dir, config_path) = workspace();
        cli::run_evaluate(Some(&config_path), Some("2024-01-03"), true, false).unwrap();
        assert!(stored_events(&dir).list_events(None, None).unwrap().is_empty());
    }

    #[test]
    fn bad_as_of_fails_before_evaluating() {
        let (dir, config_path) = workspace();
        let result = cli::run_evaluate(Some(&config_path), Some("03/01/2024"), false, false);
        assert!(matches!(result, Err(QcwatchError::ConfigInvalid { .. })));
        assert!(!dir.path().join("qcwatch.db").exists());
    }
}
