//! Domain error types.

/// A compile or evaluation error from the expression sandbox, with the byte
/// offset of the offending construct.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("expression error at position {position}: {message}")]
pub struct ExpressionError {
    pub message: String,
    pub position: usize,
}

impl ExpressionError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let column = input
            .char_indices()
            .take_while(|(offset, _)| *offset < self.position)
            .count();
        let caret = " ".repeat(column) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Per-rule evaluation failure. A failing rule is reported and skipped; it
/// never aborts the surrounding run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("data unavailable for {instrument_id}: {reason}")]
    DataUnavailable {
        instrument_id: String,
        reason: String,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("series fetch for {instrument_id} timed out after {waited_ms}ms")]
    Timeout { instrument_id: String, waited_ms: u64 },

    #[error("event storage error: {reason}")]
    Storage { reason: String },
}

impl EvaluationError {
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::DataUnavailable { .. } => "data_unavailable",
            EvaluationError::Configuration { .. } => "configuration",
            EvaluationError::Expression(_) => "expression",
            EvaluationError::Timeout { .. } => "timeout",
            EvaluationError::Storage { .. } => "storage",
        }
    }
}

/// Top-level error type for qcwatch.
#[derive(Debug, thiserror::Error)]
pub enum QcwatchError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("invalid rule {rule_id}: {reason}")]
    RuleInvalid { rule_id: String, reason: String },

    #[error("no data for {instrument_id}")]
    DataUnavailable { instrument_id: String },

    #[error("invalid series for {instrument_id}: {reason}")]
    SeriesInvalid {
        instrument_id: String,
        reason: String,
    },

    #[error("alert event {event_id} not found")]
    EventNotFound { event_id: String },

    #[error("rule {rule_id} already has an active event; {event_id} was not stored")]
    ActiveEventConflict { rule_id: String, event_id: String },

    #[error("alert event {event_id} is {state} and cannot be {action}")]
    InvalidTransition {
        event_id: String,
        state: String,
        action: String,
    },

    #[error("notification via {channel} failed: {reason}")]
    Notification { channel: String, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&QcwatchError> for std::process::ExitCode {
    fn from(err: &QcwatchError) -> Self {
        let code: u8 = match err {
            QcwatchError::Io(_) | QcwatchError::Json(_) | QcwatchError::Notification { .. } => 1,
            QcwatchError::ConfigParse { .. }
            | QcwatchError::ConfigMissing { .. }
            | QcwatchError::ConfigInvalid { .. } => 2,
            QcwatchError::Database { .. } | QcwatchError::DatabaseQuery { .. } => 3,
            QcwatchError::Expression(_) | QcwatchError::RuleInvalid { .. } => 4,
            QcwatchError::DataUnavailable { .. } | QcwatchError::SeriesInvalid { .. } => 5,
            QcwatchError::EventNotFound { .. }
            | QcwatchError::InvalidTransition { .. }
            | QcwatchError::ActiveEventConflict { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
