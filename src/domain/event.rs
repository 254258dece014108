//! Persistent alert events and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::evaluator::CandidateSignal;
use crate::domain::rule::{AlertRule, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventState {
    Open,
    Acknowledged,
    Resolved,
}

impl EventState {
    /// Open and acknowledged events still count against a rule's single slot.
    pub fn is_active(self) -> bool {
        !matches!(self, EventState::Resolved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Open => "OPEN",
            EventState::Acknowledged => "ACKNOWLEDGED",
            EventState::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OPEN" => Ok(EventState::Open),
            "ACKNOWLEDGED" | "ACK" => Ok(EventState::Acknowledged),
            "RESOLVED" => Ok(EventState::Resolved),
            other => Err(format!("unknown event state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub rule_id: String,
    pub instrument_id: String,
    pub severity: Severity,
    pub message: String,
    pub opened_at: DateTime<Utc>,
    pub state: EventState,
    pub last_observed_value: Option<f64>,
    pub last_seen_at: DateTime<Utc>,
    pub ack_note: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertEvent {
    /// A fresh OPEN event for a rule that just started triggering.
    pub fn open(rule: &AlertRule, candidate: &CandidateSignal, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            instrument_id: rule.instrument_id.clone(),
            severity: rule.severity,
            message: candidate.message.clone(),
            opened_at: at,
            state: EventState::Open,
            last_observed_value: candidate.observed_value,
            last_seen_at: at,
            ack_note: None,
            resolved_at: None,
        }
    }

    /// Copy with the latest observation; state is left as is.
    pub fn refreshed(&self, candidate: &CandidateSignal, at: DateTime<Utc>) -> Self {
        Self {
            message: candidate.message.clone(),
            last_observed_value: candidate.observed_value,
            last_seen_at: at,
            ..self.clone()
        }
    }

    pub fn acknowledged(&self, note: Option<String>) -> Self {
        Self {
            state: EventState::Acknowledged,
            ack_note: note.or_else(|| self.ack_note.clone()),
            ..self.clone()
        }
    }

    pub fn resolved(&self, at: DateTime<Utc>) -> Self {
        Self {
            state: EventState::Resolved,
            resolved_at: Some(at),
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// What a candidate signal did to a rule's slot in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened(AlertEvent),
    Updated(AlertEvent),
    Resolved(AlertEvent),
    Unchanged,
}

impl Transition {
    pub fn event(&self) -> Option<&AlertEvent> {
        match self {
            Transition::Opened(e) | Transition::Updated(e) | Transition::Resolved(e) => Some(e),
            Transition::Unchanged => None,
        }
    }
}
