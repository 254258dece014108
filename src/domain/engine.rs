//! Evaluation runs.
//!
//! `run_evaluation` validates each enabled rule, fetches its series (and
//! reference series) through the series port, computes QC signals when the
//! rule needs them, evaluates the rule and hands the candidate to the
//! ledger. Rules are evaluated in parallel on a rayon pool; the ledger is
//! the only shared mutable state. A failing rule is recorded in the report
//! and never stops the run. Newly opened events are handed to the
//! notification dispatcher, when one is attached, after the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::error::{EvaluationError, QcwatchError};
use crate::domain::evaluator::{self, EvaluationInput};
use crate::domain::event::{AlertEvent, Transition};
use crate::domain::ledger::EventLedger;
use crate::domain::notification::{DeliveryRecord, Dispatcher};
use crate::domain::qc::{evaluate_qc, QcConfig};
use crate::domain::rule::{AlertRule, RuleDefinition};
use crate::domain::series::Series;
use crate::ports::rule_port::RulePort;
use crate::ports::series_port::{SeriesPort, SeriesWindow};

pub const DEFAULT_SERIES_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HISTORY_PADDING: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub qc: QcConfig,
    /// `None` waits for the series port indefinitely.
    pub series_timeout: Option<Duration>,
    /// Worker threads; 0 lets rayon pick.
    pub workers: usize,
    /// Extra bars fetched beyond what a rule strictly needs.
    pub history_padding: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qc: QcConfig::default(),
            series_timeout: Some(Duration::from_millis(DEFAULT_SERIES_TIMEOUT_MS)),
            workers: 0,
            history_padding: DEFAULT_HISTORY_PADDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub rule_id: String,
    pub instrument_id: String,
    pub error: EvaluationError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub rule_id: String,
    pub instrument_id: String,
    pub kind: &'static str,
    pub message: String,
}

impl From<&RuleFailure> for FailureSummary {
    fn from(f: &RuleFailure) -> Self {
        Self {
            rule_id: f.rule_id.clone(),
            instrument_id: f.instrument_id.clone(),
            kind: f.error.kind(),
            message: f.error.to_string(),
        }
    }
}

/// Outcome of one evaluation run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationReport {
    pub as_of: DateTime<Utc>,
    pub evaluated: usize,
    pub events_opened: Vec<AlertEvent>,
    pub events_updated: Vec<AlertEvent>,
    pub events_resolved: Vec<AlertEvent>,
    pub failures: Vec<RuleFailure>,
    pub notifications: Vec<DeliveryRecord>,
}

impl EvaluationReport {
    pub fn failure_summaries(&self) -> Vec<FailureSummary> {
        self.failures.iter().map(FailureSummary::from).collect()
    }

    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Opened(e) => self.events_opened.push(e),
            Transition::Updated(e) => self.events_updated.push(e),
            Transition::Resolved(e) => self.events_resolved.push(e),
            Transition::Unchanged => {}
        }
    }
}

pub struct Engine {
    series: Arc<dyn SeriesPort>,
    ledger: Arc<EventLedger>,
    config: EngineConfig,
    pool: rayon::ThreadPool,
    fetches_in_flight: Arc<AtomicUsize>,
    notifier: Option<Arc<Dispatcher>>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(
        series: Arc<dyn SeriesPort>,
        ledger: Arc<EventLedger>,
        config: EngineConfig,
    ) -> Result<Self, QcwatchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("qcwatch-eval-{}", i))
            .build()
            .map_err(|e| QcwatchError::ConfigInvalid {
                section: "engine".into(),
                key: "workers".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            series,
            ledger,
            config,
            pool,
            fetches_in_flight: Arc::new(AtomicUsize::new(0)),
            notifier: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<Dispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn notifier(&self) -> Option<&Dispatcher> {
        self.notifier.as_deref()
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate every enabled rule in `rules` as of `as_of`.
    pub fn run_evaluation(&self, rules: &[RuleDefinition], as_of: DateTime<Utc>) -> EvaluationReport {
        let enabled: Vec<&RuleDefinition> = rules.iter().filter(|r| r.enabled).collect();
        debug!(rules = enabled.len(), %as_of, "evaluation run starting");

        let outcomes: Vec<Result<Transition, RuleFailure>> = self.pool.install(|| {
            enabled
                .par_iter()
                .map(|def| {
                    self.evaluate_rule(def, as_of).map_err(|error| RuleFailure {
                        rule_id: def.id.clone(),
                        instrument_id: def.instrument_id.clone(),
                        error,
                    })
                })
                .collect()
        });

        let mut report = EvaluationReport {
            as_of,
            evaluated: enabled.len(),
            ..EvaluationReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(transition) => report.record(transition),
                Err(failure) => {
                    warn!(
                        rule_id = %failure.rule_id,
                        kind = failure.error.kind(),
                        "rule evaluation failed: {}",
                        failure.error
                    );
                    report.failures.push(failure);
                }
            }
        }

        if let Some(notifier) = &self.notifier {
            report.notifications = notifier.notify_opened(&report.events_opened);
        }

        info!(
            evaluated = report.evaluated,
            opened = report.events_opened.len(),
            updated = report.events_updated.len(),
            resolved = report.events_resolved.len(),
            failed = report.failures.len(),
            notified = report.notifications.iter().filter(|r| r.success).count(),
            "evaluation run finished"
        );
        report
    }

    /// Load enabled rules from a rule store and evaluate them.
    pub fn run_from_store(
        &self,
        rules: &dyn RulePort,
        as_of: DateTime<Utc>,
    ) -> Result<EvaluationReport, QcwatchError> {
        let definitions = rules.list_enabled_rules()?;
        Ok(self.run_evaluation(&definitions, as_of))
    }

    fn evaluate_rule(
        &self,
        def: &RuleDefinition,
        as_of: DateTime<Utc>,
    ) -> Result<Transition, EvaluationError> {
        let rule = AlertRule::from_definition(def)?;
        let qc_config = self.config.qc.with_overrides(&rule.qc_overrides);
        let window = SeriesWindow::new(
            as_of.date_naive(),
            rule.required_observations(&self.config.qc) + self.config.history_padding,
        );

        let series = self.fetch(&rule.instrument_id, window)?;
        let reference = match rule.reference_instrument() {
            Some(reference_id) => Some(self.fetch(reference_id, window)?),
            None => None,
        };
        let qc = rule
            .needs_qc()
            .then(|| evaluate_qc(&series, &qc_config, window.end));

        let mut input = EvaluationInput::new(&series, window.end);
        if let Some(qc) = &qc {
            input = input.with_qc(qc);
        }
        if let Some(reference) = &reference {
            input = input.with_reference(reference);
        }

        let candidate = evaluator::evaluate(&rule, &input)?;
        debug!(
            rule_id = %rule.id,
            triggered = candidate.triggered,
            observed = ?candidate.observed_value,
            "rule evaluated"
        );
        self.ledger.apply(&rule, &candidate, as_of)
    }

    /// Fetch through the series port, giving up after the configured timeout.
    ///
    /// Each timed fetch runs on a helper thread. A fetch that outlives its
    /// timeout is not cancelled: its thread keeps running until the port
    /// returns and the result is dropped. At most twice the worker count of
    /// helper threads may be alive at once; past that, new fetches fail as
    /// data unavailable instead of piling up more threads behind a hung port.
    fn fetch(&self, instrument_id: &str, window: SeriesWindow) -> Result<Series, EvaluationError> {
        let unavailable = |reason: String| EvaluationError::DataUnavailable {
            instrument_id: instrument_id.to_string(),
            reason,
        };
        let into_unavailable = |e: QcwatchError| unavailable(e.to_string());

        let Some(timeout) = self.config.series_timeout else {
            return self
                .series
                .get_series(instrument_id, window)
                .map_err(into_unavailable);
        };

        let limit = self.pool.current_num_threads() * 2;
        let running = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.fetches_in_flight));
        if running >= limit {
            warn!(instrument_id, running, "series fetches still outstanding, not starting another");
            return Err(unavailable(format!(
                "{} earlier series fetches are still running",
                running
            )));
        }

        let (tx, rx) = mpsc::channel();
        let port = Arc::clone(&self.series);
        let id = instrument_id.to_string();
        thread::Builder::new()
            .name(format!("qcwatch-fetch-{}", instrument_id))
            .spawn(move || {
                let _guard = guard;
                let _ = tx.send(port.get_series(&id, window));
            })
            .map_err(|e| unavailable(format!("could not start fetch: {}", e)))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(into_unavailable),
            Err(RecvTimeoutError::Timeout) => {
                warn!(instrument_id, waited_ms = timeout.as_millis() as u64, "series fetch abandoned");
                Err(EvaluationError::Timeout {
                    instrument_id: instrument_id.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(unavailable("series fetch ended without a result".to_string()))
            }
        }
    }

    /// Repeat evaluation runs every `interval` until `max_runs` runs have
    /// completed, or forever when it is `None`. Rules are re-read from the
    /// store on every run. Deliveries that failed on an earlier run are
    /// retried once per run.
    pub fn watch(&self, rules: &dyn RulePort, interval: Duration, max_runs: Option<u64>) -> WatchStats {
        let mut stats = WatchStats::default();
        while max_runs.is_none_or(|max| stats.checks < max) {
            let as_of = Utc::now();
            stats.checks += 1;
            stats.last_run = Some(as_of);
            if let Some(notifier) = &self.notifier {
                let retried = notifier.retry_failed();
                stats.notifications_failed += retried.iter().filter(|r| !r.success).count() as u64;
            }
            match self.run_from_store(rules, as_of) {
                Ok(report) => {
                    stats.opened += report.events_opened.len() as u64;
                    stats.resolved += report.events_resolved.len() as u64;
                    stats.rule_failures += report.failures.len() as u64;
                    stats.notifications_failed +=
                        report.notifications.iter().filter(|r| !r.success).count() as u64;
                }
                Err(e) => {
                    warn!("could not load rules: {}", e);
                    stats.errors += 1;
                }
            }
            if max_runs.is_some_and(|max| stats.checks >= max) {
                break;
            }
            thread::sleep(interval);
        }
        info!(
            checks = stats.checks,
            errors = stats.errors,
            opened = stats.opened,
            resolved = stats.resolved,
            "watch stopped"
        );
        stats
    }
}

/// Counters kept across scheduled runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WatchStats {
    pub checks: u64,
    pub errors: u64,
    pub rule_failures: u64,
    pub opened: u64,
    pub resolved: u64,
    pub notifications_failed: u64,
    pub last_run: Option<DateTime<Utc>>,
}
