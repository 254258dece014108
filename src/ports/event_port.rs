//! Alert event sink port.

use crate::domain::error::QcwatchError;
use crate::domain::event::{AlertEvent, EventState};

pub trait EventPort: Send + Sync {
    /// Insert or replace by `event.id`; writing the same event twice is a no-op.
    fn upsert_event(&self, event: &AlertEvent) -> Result<(), QcwatchError>;

    /// Every OPEN or ACKNOWLEDGED event.
    fn load_active_events(&self) -> Result<Vec<AlertEvent>, QcwatchError>;

    fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>, QcwatchError>;

    /// The newest OPEN or ACKNOWLEDGED event for one rule.
    fn active_event_for_rule(&self, rule_id: &str) -> Result<Option<AlertEvent>, QcwatchError> {
        Ok(self
            .load_active_events()?
            .into_iter()
            .filter(|e| e.rule_id == rule_id)
            .max_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id))))
    }

    /// Newest first by `opened_at`.
    fn list_events(
        &self,
        state: Option<EventState>,
        limit: Option<usize>,
    ) -> Result<Vec<AlertEvent>, QcwatchError>;
}
