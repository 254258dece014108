//! Alert rule definitions.
//!
//! - `RuleDefinition`: the raw row supplied by a rule store (string-typed
//!   parameters, free-form type tag)
//! - `AlertRule`: a validated rule whose `RuleKind` is a closed variant over
//!   the seven rule types, each carrying its own parameter struct
//!
//! Conversion happens once at load; any problem is a per-rule
//! configuration error and never reaches evaluation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::EvaluationError;
use crate::domain::expression::Expression;
use crate::domain::qc::{QcConfig, QcOverrides};

pub const DEFAULT_LOOKBACK: usize = 20;
pub const DEFAULT_BASELINE_WINDOW: usize = 60;

/// Names a custom expression may reference. `threshold` is only bound when
/// the rule defines one.
pub const EXPRESSION_VARIABLES: [&str; 11] = [
    "price",
    "value",
    "prev_price",
    "change",
    "change_pct",
    "z",
    "volatility",
    "missing_pct",
    "days_stale",
    "outliers",
    "latest_outlier",
];

/// A rule as stored, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub name: String,
    pub instrument_id: String,
    pub rule_type: String,
    pub parameters: BTreeMap<String, String>,
    pub severity: String,
    pub enabled: bool,
}

impl RuleDefinition {
    pub fn new(id: &str, instrument_id: &str, rule_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            instrument_id: instrument_id.to_string(),
            rule_type: rule_type.to_string(),
            parameters: BTreeMap::new(),
            severity: Severity::default().to_string(),
            enabled: true,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity.to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    PriceThreshold,
    ZScore,
    Volatility,
    Staleness,
    MissingData,
    CorrelationBreak,
    CustomExpression,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::PriceThreshold => "price_threshold",
            RuleType::ZScore => "z_score",
            RuleType::Volatility => "volatility",
            RuleType::Staleness => "staleness",
            RuleType::MissingData => "missing_data",
            RuleType::CorrelationBreak => "correlation_break",
            RuleType::CustomExpression => "custom_expression",
        }
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "price_threshold" => Ok(RuleType::PriceThreshold),
            "z_score" | "zscore" => Ok(RuleType::ZScore),
            "volatility" => Ok(RuleType::Volatility),
            "staleness" | "data_staleness" => Ok(RuleType::Staleness),
            "missing_data" | "data_missing" => Ok(RuleType::MissingData),
            "correlation_break" => Ok(RuleType::CorrelationBreak),
            "custom_expression" | "custom" => Ok(RuleType::CustomExpression),
            other => Err(format!("unknown rule type '{}'", other)),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
}

impl Comparator {
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Gt => left > right,
            Comparator::Lt => left < right,
            Comparator::Ge => left >= right,
            Comparator::Le => left <= right,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
        }
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            ">" | "gt" => Ok(Comparator::Gt),
            "<" | "lt" => Ok(Comparator::Lt),
            ">=" | "ge" | "gte" => Ok(Comparator::Ge),
            "<=" | "le" | "lte" => Ok(Comparator::Le),
            other => Err(format!("unknown operator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    #[default]
    Simple,
    Log,
}

impl FromStr for ReturnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" | "pct" => Ok(ReturnKind::Simple),
            "log" => Ok(ReturnKind::Log),
            other => Err(format!("unknown return kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceThresholdParams {
    pub operator: Comparator,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZScoreParams {
    pub threshold: f64,
    pub lookback: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityParams {
    pub threshold: f64,
    pub lookback: usize,
    pub returns: ReturnKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StalenessParams {
    pub threshold_days: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingDataParams {
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationBreakParams {
    pub reference_instrument: String,
    pub lookback: usize,
    /// Trigger when the rolling correlation drops below this floor.
    pub min_correlation: Option<f64>,
    /// Trigger when |rolling - baseline| exceeds this delta.
    pub max_delta: Option<f64>,
    pub baseline_window: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomExpressionParams {
    pub expression: Expression,
    pub threshold: Option<f64>,
    pub lookback: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    PriceThreshold(PriceThresholdParams),
    ZScore(ZScoreParams),
    Volatility(VolatilityParams),
    Staleness(StalenessParams),
    MissingData(MissingDataParams),
    CorrelationBreak(CorrelationBreakParams),
    CustomExpression(CustomExpressionParams),
}

impl RuleKind {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleKind::PriceThreshold(_) => RuleType::PriceThreshold,
            RuleKind::ZScore(_) => RuleType::ZScore,
            RuleKind::Volatility(_) => RuleType::Volatility,
            RuleKind::Staleness(_) => RuleType::Staleness,
            RuleKind::MissingData(_) => RuleType::MissingData,
            RuleKind::CorrelationBreak(_) => RuleType::CorrelationBreak,
            RuleKind::CustomExpression(_) => RuleType::CustomExpression,
        }
    }
}

/// A validated, evaluable rule. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub instrument_id: String,
    pub severity: Severity,
    pub kind: RuleKind,
    pub qc_overrides: QcOverrides,
}

impl AlertRule {
    pub fn rule_type(&self) -> RuleType {
        self.kind.rule_type()
    }

    /// Instrument whose series a correlation rule compares against.
    pub fn reference_instrument(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::CorrelationBreak(p) => Some(&p.reference_instrument),
            _ => None,
        }
    }

    /// Observations the rule needs from the series accessor.
    pub fn required_observations(&self, qc: &QcConfig) -> usize {
        let qc = qc.with_overrides(&self.qc_overrides);
        let own = match &self.kind {
            RuleKind::PriceThreshold(_) => 1,
            RuleKind::ZScore(p) => p.lookback,
            RuleKind::Volatility(p) => p.lookback + 1,
            RuleKind::Staleness(_) | RuleKind::MissingData(_) => 1,
            RuleKind::CorrelationBreak(p) => p.lookback.max(p.baseline_window),
            RuleKind::CustomExpression(p) => p.lookback + 1,
        };
        own.max(qc.missing_window).max(qc.outlier_window)
    }

    /// Whether the rule's outcome depends on QC signals.
    pub fn needs_qc(&self) -> bool {
        matches!(
            self.kind,
            RuleKind::Staleness(_) | RuleKind::MissingData(_) | RuleKind::CustomExpression(_)
        )
    }

    pub fn from_definition(def: &RuleDefinition) -> Result<AlertRule, EvaluationError> {
        if def.id.trim().is_empty() {
            return Err(config_error("rule id is required"));
        }
        if def.instrument_id.trim().is_empty() {
            return Err(config_error("instrument_id is required"));
        }
        let rule_type: RuleType = def.rule_type.parse().map_err(config_error)?;
        let severity: Severity = def.severity.parse().map_err(config_error)?;
        let params = Params(&def.parameters);

        let kind = match rule_type {
            RuleType::PriceThreshold => RuleKind::PriceThreshold(PriceThresholdParams {
                operator: params.parsed("operator")?.unwrap_or(Comparator::Gt),
                threshold: params.required_f64("threshold")?,
            }),
            RuleType::ZScore => RuleKind::ZScore(ZScoreParams {
                threshold: params.required_f64("threshold")?,
                lookback: params.window("lookback", DEFAULT_LOOKBACK, 2)?,
            }),
            RuleType::Volatility => RuleKind::Volatility(VolatilityParams {
                threshold: params.required_f64("threshold")?,
                lookback: params.window("lookback", DEFAULT_LOOKBACK, 2)?,
                returns: params.parsed("returns")?.unwrap_or_default(),
            }),
            RuleType::Staleness => RuleKind::Staleness(StalenessParams {
                threshold_days: params.required_f64("threshold")?,
            }),
            RuleType::MissingData => {
                let threshold = params.required_f64("threshold")?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(config_error(format!(
                        "parameter 'threshold' is a fraction between 0 and 1, got {}",
                        threshold
                    )));
                }
                RuleKind::MissingData(MissingDataParams { threshold })
            }
            RuleType::CorrelationBreak => correlation_params(&params, &def.instrument_id)?,
            RuleType::CustomExpression => {
                let source = params
                    .string("expression")
                    .ok_or_else(|| config_error("parameter 'expression' is required"))?;
                let threshold = params.optional_f64("threshold")?;
                let mut allowed: Vec<&str> = EXPRESSION_VARIABLES.to_vec();
                if threshold.is_some() {
                    allowed.push("threshold");
                }
                let expression = Expression::compile(source, &allowed)?;
                RuleKind::CustomExpression(CustomExpressionParams {
                    expression,
                    threshold,
                    lookback: params.window("lookback", DEFAULT_LOOKBACK, 2)?,
                })
            }
        };

        let qc_overrides = QcOverrides {
            missing_window: params.optional_window("missing_window", 1)?,
            outlier_window: params.optional_window("outlier_window", 2)?,
            outlier_k: match params.optional_f64("outlier_k")? {
                Some(k) if k <= 0.0 => {
                    return Err(config_error("parameter 'outlier_k' must be positive"));
                }
                k => k,
            },
        };

        Ok(AlertRule {
            id: def.id.trim().to_string(),
            name: if def.name.trim().is_empty() {
                def.id.trim().to_string()
            } else {
                def.name.trim().to_string()
            },
            instrument_id: def.instrument_id.trim().to_string(),
            severity,
            kind,
            qc_overrides,
        })
    }
}

fn correlation_params(params: &Params, instrument_id: &str) -> Result<RuleKind, EvaluationError> {
    let reference = params
        .string("reference")
        .ok_or_else(|| config_error("parameter 'reference' is required"))?;
    if reference == instrument_id.trim() {
        return Err(config_error(
            "parameter 'reference' must differ from the rule's instrument",
        ));
    }

    let min_correlation = match params.optional_f64("min_correlation")? {
        Some(v) => Some(v),
        None => params.optional_f64("threshold")?,
    };
    let max_delta = params.optional_f64("max_delta")?;
    if min_correlation.is_none() && max_delta.is_none() {
        return Err(config_error(
            "correlation_break needs 'min_correlation' (or 'threshold') and/or 'max_delta'",
        ));
    }
    if let Some(floor) = min_correlation {
        if !(-1.0..=1.0).contains(&floor) {
            return Err(config_error(format!(
                "min_correlation must be within [-1, 1], got {}",
                floor
            )));
        }
    }
    if max_delta.is_some_and(|d| d < 0.0) {
        return Err(config_error("max_delta must be non-negative"));
    }

    let lookback = params.window("lookback", DEFAULT_LOOKBACK, 3)?;
    let baseline_window = params.window("baseline_window", DEFAULT_BASELINE_WINDOW, 3)?;
    if max_delta.is_some() && baseline_window < lookback {
        return Err(config_error(format!(
            "baseline_window ({}) must be at least lookback ({})",
            baseline_window, lookback
        )));
    }

    Ok(RuleKind::CorrelationBreak(CorrelationBreakParams {
        reference_instrument: reference.to_string(),
        lookback,
        min_correlation,
        max_delta,
        baseline_window,
    }))
}

fn config_error(reason: impl Into<String>) -> EvaluationError {
    EvaluationError::Configuration {
        reason: reason.into(),
    }
}

struct Params<'a>(&'a BTreeMap<String, String>);

impl Params<'_> {
    fn string(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn optional_f64(&self, key: &str) -> Result<Option<f64>, EvaluationError> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(config_error(format!(
                "parameter '{}' must be a finite number, got '{}'",
                key, raw
            ))),
        }
    }

    fn required_f64(&self, key: &str) -> Result<f64, EvaluationError> {
        self.optional_f64(key)?
            .ok_or_else(|| config_error(format!("parameter '{}' is required", key)))
    }

    fn optional_window(&self, key: &str, min: usize) -> Result<Option<usize>, EvaluationError> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.parse::<usize>() {
            Ok(v) if v >= min => Ok(Some(v)),
            _ => Err(config_error(format!(
                "parameter '{}' must be an integer >= {}, got '{}'",
                key, min, raw
            ))),
        }
    }

    fn window(&self, key: &str, default: usize, min: usize) -> Result<usize, EvaluationError> {
        Ok(self.optional_window(key, min)?.unwrap_or(default))
    }

    fn parsed<T: FromStr<Err = String>>(&self, key: &str) -> Result<Option<T>, EvaluationError> {
        self.string(key)
            .map(|raw| raw.parse::<T>().map_err(config_error))
            .transpose()
    }
}
