//! Rule evaluation: one pure strategy per rule type.
//!
//! `evaluate` is a function of its inputs only; the same rule, series, QC
//! signal and reference series always produce the same `CandidateSignal`.
//! Degenerate computations (short history, zero deviation, no overlap with
//! the reference) come back as a non-triggered candidate, never an error.

use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::error::EvaluationError;
use crate::domain::expression::Variables;
use crate::domain::qc::QcSignal;
use crate::domain::rule::{
    AlertRule, CorrelationBreakParams, CustomExpressionParams, MissingDataParams,
    PriceThresholdParams, ReturnKind, RuleKind, StalenessParams, VolatilityParams, ZScoreParams,
};
use crate::domain::series::Series;
use crate::domain::stats;

/// Ephemeral triggered/not-triggered result of evaluating one rule once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSignal {
    pub rule_id: String,
    pub triggered: bool,
    pub observed_value: Option<f64>,
    pub as_of_date: NaiveDate,
    pub message: String,
}

/// Everything a strategy may read.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub series: &'a Series,
    pub qc: Option<&'a QcSignal>,
    pub reference: Option<&'a Series>,
    pub as_of: NaiveDate,
}

impl<'a> EvaluationInput<'a> {
    pub fn new(series: &'a Series, as_of: NaiveDate) -> Self {
        Self {
            series,
            qc: None,
            reference: None,
            as_of,
        }
    }

    pub fn with_qc(mut self, qc: &'a QcSignal) -> Self {
        self.qc = Some(qc);
        self
    }

    pub fn with_reference(mut self, reference: &'a Series) -> Self {
        self.reference = Some(reference);
        self
    }

    fn require_qc(&self) -> Result<&'a QcSignal, EvaluationError> {
        self.qc.ok_or_else(|| EvaluationError::Configuration {
            reason: "rule needs quality signals but none were computed".to_string(),
        })
    }
}

struct Outcome {
    triggered: bool,
    observed_value: Option<f64>,
    message: String,
}

impl Outcome {
    fn degenerate(message: impl Into<String>) -> Self {
        Self {
            triggered: false,
            observed_value: None,
            message: message.into(),
        }
    }

    fn observed(triggered: bool, value: f64, message: String) -> Self {
        Self {
            triggered,
            observed_value: value.is_finite().then_some(value),
            message,
        }
    }
}

pub fn evaluate(
    rule: &AlertRule,
    input: &EvaluationInput<'_>,
) -> Result<CandidateSignal, EvaluationError> {
    let outcome = match &rule.kind {
        RuleKind::PriceThreshold(p) => price_threshold(p, input),
        RuleKind::ZScore(p) => z_score(p, input),
        RuleKind::Volatility(p) => volatility(p, input),
        RuleKind::Staleness(p) => staleness(p, input)?,
        RuleKind::MissingData(p) => missing_data(p, input)?,
        RuleKind::CorrelationBreak(p) => correlation_break(p, input)?,
        RuleKind::CustomExpression(p) => custom_expression(p, input)?,
    };

    Ok(CandidateSignal {
        rule_id: rule.id.clone(),
        triggered: outcome.triggered,
        observed_value: outcome.observed_value,
        as_of_date: input.as_of,
        message: outcome.message,
    })
}

fn latest_finite(series: &Series) -> Option<f64> {
    series.latest().map(|b| b.value).filter(|v| v.is_finite())
}

fn price_threshold(p: &PriceThresholdParams, input: &EvaluationInput<'_>) -> Outcome {
    let id = input.series.instrument_id();
    let Some(price) = latest_finite(input.series) else {
        return Outcome::degenerate(format!("{} has no finite latest value", id));
    };
    let triggered = p.operator.apply(price, p.threshold);
    Outcome::observed(
        triggered,
        price,
        format!(
            "{} price {:.4} {} {:.4}: {}",
            id,
            price,
            p.operator.symbol(),
            p.threshold,
            if triggered { "condition met" } else { "condition not met" }
        ),
    )
}

/// Z-score of the latest value against the trailing `lookback` values,
/// latest included. `None` when the window is short or flat.
fn latest_z(series: &Series, lookback: usize) -> Option<f64> {
    let window = series.tail(lookback);
    if window.len() < lookback {
        return None;
    }
    let latest = latest_finite(series)?;
    let finite: Vec<f64> = window
        .iter()
        .map(|b| b.value)
        .filter(|v| v.is_finite())
        .collect();
    stats::z_score(latest, &finite)
}

fn z_score(p: &ZScoreParams, input: &EvaluationInput<'_>) -> Outcome {
    let id = input.series.instrument_id();
    let Some(z) = latest_z(input.series, p.lookback) else {
        return Outcome::degenerate(format!(
            "{} z-score undefined over {} observations",
            id, p.lookback
        ));
    };
    let triggered = z.abs() > p.threshold;
    Outcome::observed(
        triggered,
        z,
        format!("{} z-score {:.2} against threshold {:.2}", id, z, p.threshold),
    )
}

/// Annualized volatility of the last `lookback` returns.
fn latest_volatility(series: &Series, lookback: usize, kind: ReturnKind) -> Option<f64> {
    let window = series.tail(lookback + 1);
    if window.len() < lookback + 1 {
        return None;
    }
    let values: Vec<f64> = window.iter().map(|b| b.value).collect();
    let returns = match kind {
        ReturnKind::Simple => stats::simple_returns(&values),
        ReturnKind::Log => stats::log_returns(&values),
    };
    stats::annualized_volatility(&returns)
}

fn volatility(p: &VolatilityParams, input: &EvaluationInput<'_>) -> Outcome {
    let id = input.series.instrument_id();
    let Some(vol) = latest_volatility(input.series, p.lookback, p.returns) else {
        return Outcome::degenerate(format!(
            "{} volatility undefined over {} returns",
            id, p.lookback
        ));
    };
    let triggered = vol > p.threshold;
    Outcome::observed(
        triggered,
        vol,
        format!(
            "{} annualized volatility {:.2}% against {:.2}%",
            id,
            vol * 100.0,
            p.threshold * 100.0
        ),
    )
}

fn staleness(p: &StalenessParams, input: &EvaluationInput<'_>) -> Result<Outcome, EvaluationError> {
    let qc = input.require_qc()?;
    let triggered = qc.days_stale > p.threshold_days;
    Ok(Outcome::observed(
        triggered,
        qc.days_stale,
        format!(
            "{} data is {} days stale (threshold {} days)",
            qc.instrument_id, qc.days_stale, p.threshold_days
        ),
    ))
}

fn missing_data(
    p: &MissingDataParams,
    input: &EvaluationInput<'_>,
) -> Result<Outcome, EvaluationError> {
    let qc = input.require_qc()?;
    let triggered = qc.missing_pct > p.threshold;
    Ok(Outcome::observed(
        triggered,
        qc.missing_pct,
        format!(
            "{} missing {:.2}% of expected observations (threshold {:.2}%)",
            qc.instrument_id,
            qc.missing_pct * 100.0,
            p.threshold * 100.0
        ),
    ))
}

fn correlation_break(
    p: &CorrelationBreakParams,
    input: &EvaluationInput<'_>,
) -> Result<Outcome, EvaluationError> {
    let id = input.series.instrument_id();
    let reference = input
        .reference
        .ok_or_else(|| EvaluationError::DataUnavailable {
            instrument_id: p.reference_instrument.clone(),
            reason: "reference series not supplied".to_string(),
        })?;
    if reference.is_empty() {
        return Err(EvaluationError::DataUnavailable {
            instrument_id: p.reference_instrument.clone(),
            reason: "reference series has no bars".to_string(),
        });
    }

    let pairs = input.series.align(reference);
    let rolling = (pairs.len() >= p.lookback)
        .then(|| stats::pearson(&pairs[pairs.len() - p.lookback..]))
        .flatten();
    let Some(rolling) = rolling else {
        return Ok(Outcome::degenerate(format!(
            "{} vs {} correlation undefined over {} shared observations",
            id, p.reference_instrument, p.lookback
        )));
    };

    let mut reasons = Vec::new();
    if let Some(floor) = p.min_correlation {
        if rolling < floor {
            reasons.push(format!("below floor {:.2}", floor));
        }
    }
    if let Some(delta) = p.max_delta {
        let baseline = (pairs.len() >= p.baseline_window)
            .then(|| stats::pearson(&pairs[pairs.len() - p.baseline_window..]))
            .flatten();
        if let Some(baseline) = baseline {
            let diff = (rolling - baseline).abs();
            if diff > delta {
                reasons.push(format!(
                    "moved {:.2} from {}-day baseline {:.2} (max {:.2})",
                    diff, p.baseline_window, baseline, delta
                ));
            }
        }
    }

    let triggered = !reasons.is_empty();
    let detail = if triggered {
        reasons.join("; ")
    } else {
        "within bounds".to_string()
    };
    Ok(Outcome::observed(
        triggered,
        rolling,
        format!(
            "{} vs {} {}-day correlation {:.2}: {}",
            id, p.reference_instrument, p.lookback, rolling, detail
        ),
    ))
}

/// Variable namespace a custom expression is evaluated against. Statistics
/// that are undefined for the current window are bound to zero.
pub fn expression_variables(
    p: &CustomExpressionParams,
    series: &Series,
    qc: &QcSignal,
) -> Option<Variables> {
    let price = latest_finite(series)?;
    let prev_price = series
        .previous()
        .map(|b| b.value)
        .filter(|v| v.is_finite())
        .unwrap_or(price);
    let change = price - prev_price;
    let change_pct = if prev_price != 0.0 {
        change / prev_price
    } else {
        0.0
    };

    let mut vars = Variables::new();
    vars.insert("price".into(), price);
    vars.insert("value".into(), price);
    vars.insert("prev_price".into(), prev_price);
    vars.insert("change".into(), change);
    vars.insert("change_pct".into(), change_pct);
    vars.insert("z".into(), latest_z(series, p.lookback).unwrap_or(0.0));
    vars.insert(
        "volatility".into(),
        latest_volatility(series, p.lookback, ReturnKind::Simple).unwrap_or(0.0),
    );
    vars.insert("missing_pct".into(), qc.missing_pct);
    vars.insert("days_stale".into(), qc.days_stale);
    vars.insert("outliers".into(), qc.outlier_flags.len() as f64);
    vars.insert(
        "latest_outlier".into(),
        if qc.is_latest_outlier() { 1.0 } else { 0.0 },
    );
    if let Some(threshold) = p.threshold {
        vars.insert("threshold".into(), threshold);
    }
    Some(vars)
}

fn custom_expression(
    p: &CustomExpressionParams,
    input: &EvaluationInput<'_>,
) -> Result<Outcome, EvaluationError> {
    let qc = input.require_qc()?;
    let id = input.series.instrument_id();
    let Some(vars) = expression_variables(p, input.series, qc) else {
        return Ok(Outcome::degenerate(format!(
            "{} has no finite latest value",
            id
        )));
    };
    let triggered = p.expression.evaluate(&vars)?;
    Ok(Outcome {
        triggered,
        observed_value: vars.get("price").copied(),
        message: format!(
            "{} expression `{}` is {}",
            id,
            p.expression.source(),
            triggered
        ),
    })
}
