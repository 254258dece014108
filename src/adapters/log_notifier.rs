//! Notification channel that writes alerts to the tracing log.

use tracing::{info, warn};

use crate::domain::error::QcwatchError;
use crate::domain::notification::Notification;
use crate::domain::rule::Severity;
use crate::ports::notifier_port::NotifierPort;

#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl NotifierPort for LogNotifier {
    fn send(&self, n: &Notification) -> Result<(), QcwatchError> {
        match n.severity {
            Severity::High => warn!(
                target: "qcwatch::alert",
                event_id = %n.event_id,
                rule_id = %n.rule_id,
                instrument_id = %n.instrument_id,
                value = ?n.observed_value,
                "{}", n.subject
            ),
            Severity::Medium | Severity::Low => info!(
                target: "qcwatch::alert",
                event_id = %n.event_id,
                rule_id = %n.rule_id,
                instrument_id = %n.instrument_id,
                value = ?n.observed_value,
                "{}", n.subject
            ),
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}
