//! Alert notifications and their delivery history.
//!
//! The dispatcher fans a notification out to every configured channel. A
//! failing channel is recorded and never blocks the others or the
//! evaluation run that produced the notification. Failed deliveries stay in
//! the history and can be retried later.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::event::AlertEvent;
use crate::domain::rule::Severity;
use crate::ports::notifier_port::NotifierPort;

/// Delivery records kept in memory; the oldest are dropped first.
pub const MAX_HISTORY: usize = 1000;

/// A rendered alert ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event_id: String,
    pub rule_id: String,
    pub instrument_id: String,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
    pub observed_value: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

impl Notification {
    pub fn for_opened(event: &AlertEvent) -> Self {
        let value = event
            .last_observed_value
            .map(|v| format!("{:.4}", v))
            .unwrap_or_else(|| "n/a".to_string());
        Self {
            event_id: event.id.clone(),
            rule_id: event.rule_id.clone(),
            instrument_id: event.instrument_id.clone(),
            severity: event.severity,
            subject: format!(
                "[{}] {} alert on {}",
                event.severity.to_string().to_uppercase(),
                event.rule_id,
                event.instrument_id
            ),
            body: format!(
                "rule: {}\ninstrument: {}\nseverity: {}\nvalue: {}\ndetail: {}\nopened: {}",
                event.rule_id,
                event.instrument_id,
                event.severity,
                value,
                event.message,
                event.opened_at.to_rfc3339()
            ),
            observed_value: event.last_observed_value,
            opened_at: event.opened_at,
        }
    }
}

/// One attempt to deliver one notification through one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub notification: Notification,
    pub channel: String,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct Dispatcher {
    channels: Vec<Arc<dyn NotifierPort>>,
    history: Mutex<VecDeque<DeliveryRecord>>,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn NotifierPort>>) -> Self {
        Self {
            channels,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.channel_name().to_string())
            .collect()
    }

    fn deliver(
        &self,
        channel: &dyn NotifierPort,
        notification: &Notification,
        attempt: u32,
    ) -> DeliveryRecord {
        let start = Instant::now();
        let result = channel.send(notification);
        let duration_ms = start.elapsed().as_millis() as u64;

        let error = match result {
            Ok(()) => {
                info!(
                    event_id = %notification.event_id,
                    channel = channel.channel_name(),
                    attempt,
                    duration_ms,
                    "notification delivered"
                );
                None
            }
            Err(e) => {
                warn!(
                    event_id = %notification.event_id,
                    channel = channel.channel_name(),
                    attempt,
                    error = %e,
                    "notification delivery failed"
                );
                Some(e.to_string())
            }
        };

        DeliveryRecord {
            notification: notification.clone(),
            channel: channel.channel_name().to_string(),
            attempt,
            success: error.is_none(),
            error,
            at: Utc::now(),
            duration_ms,
        }
    }

    fn record(&self, records: &[DeliveryRecord]) {
        let mut history = self.history.lock();
        history.extend(records.iter().cloned());
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    /// Send `notification` to every channel.
    pub fn dispatch(&self, notification: &Notification) -> Vec<DeliveryRecord> {
        if self.channels.is_empty() {
            debug!(event_id = %notification.event_id, "no notification channels configured");
            return Vec::new();
        }
        let records: Vec<DeliveryRecord> = self
            .channels
            .iter()
            .map(|c| self.deliver(c.as_ref(), notification, 1))
            .collect();
        self.record(&records);
        records
    }

    /// Notify every channel about each newly opened event.
    pub fn notify_opened(&self, events: &[AlertEvent]) -> Vec<DeliveryRecord> {
        events
            .iter()
            .flat_map(|e| self.dispatch(&Notification::for_opened(e)))
            .collect()
    }

    /// The most recent `limit` records, oldest first.
    pub fn history(&self, limit: usize) -> Vec<DeliveryRecord> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Deliveries whose latest attempt on their channel failed.
    pub fn failed(&self) -> Vec<DeliveryRecord> {
        let history = self.history.lock();
        let mut seen = HashSet::new();
        let mut failed: Vec<DeliveryRecord> = history
            .iter()
            .rev()
            .filter(|r| seen.insert((r.notification.event_id.clone(), r.channel.clone())))
            .filter(|r| !r.success)
            .cloned()
            .collect();
        failed.reverse();
        failed
    }

    /// Re-send each failed delivery once on the channel it failed on.
    pub fn retry_failed(&self) -> Vec<DeliveryRecord> {
        let records: Vec<DeliveryRecord> = self
            .failed()
            .into_iter()
            .filter_map(|failed| {
                let channel = self
                    .channels
                    .iter()
                    .find(|c| c.channel_name() == failed.channel)?;
                Some(self.deliver(channel.as_ref(), &failed.notification, failed.attempt + 1))
            })
            .collect();
        self.record(&records);
        records
    }
}
