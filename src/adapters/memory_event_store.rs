//! In-memory alert event sink, used for dry runs and tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::error::QcwatchError;
use crate::domain::event::{AlertEvent, EventState};
use crate::ports::event_port::EventPort;

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<String, AlertEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = AlertEvent>) -> Self {
        Self {
            events: RwLock::new(events.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Every stored event for one rule, oldest first.
    pub fn events_for_rule(&self, rule_id: &str) -> Vec<AlertEvent> {
        let mut events: Vec<AlertEvent> = self
            .events
            .read()
            .values()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        events
    }
}

impl EventPort for MemoryEventStore {
    fn upsert_event(&self, event: &AlertEvent) -> Result<(), QcwatchError> {
        self.events.write().insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn load_active_events(&self) -> Result<Vec<AlertEvent>, QcwatchError> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| e.is_active())
            .cloned()
            .collect())
    }

    fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>, QcwatchError> {
        Ok(self.events.read().get(event_id).cloned())
    }

    fn list_events(
        &self,
        state: Option<EventState>,
        limit: Option<usize>,
    ) -> Result<Vec<AlertEvent>, QcwatchError> {
        let mut events: Vec<AlertEvent> = self
            .events
            .read()
            .values()
            .filter(|e| state.is_none_or(|s| e.state == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.opened_at.cmp(&a.opened_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::Severity;
    use chrono::{TimeZone, Utc};

    fn event(id: &str, rule_id: &str, day: u32, state: EventState) -> AlertEvent {
        let at = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        AlertEvent {
            id: id.into(),
            rule_id: rule_id.into(),
            instrument_id: "TTF".into(),
            severity: Severity::Medium,
            message: String::new(),
            opened_at: at,
            state,
            last_observed_value: None,
            last_seen_at: at,
            ack_note: None,
            resolved_at: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_on_id() {
        let store = MemoryEventStore::new();
        let e = event("a", "r1", 1, EventState::Open);
        store.upsert_event(&e).unwrap();
        store.upsert_event(&e).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn active_events_exclude_resolved() {
        let store = MemoryEventStore::with_events([
            event("a", "r1", 1, EventState::Resolved),
            event("b", "r1", 2, EventState::Open),
            event("c", "r2", 3, EventState::Acknowledged),
        ]);
        let mut ids: Vec<String> = store
            .load_active_events()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn list_filters_and_limits_newest_first() {
        let store = MemoryEventStore::with_events([
            event("a", "r1", 1, EventState::Resolved),
            event("b", "r1", 2, EventState::Open),
            event("c", "r2", 3, EventState::Open),
        ]);
        let open = store.list_events(Some(EventState::Open), None).unwrap();
        assert_eq!(open.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);
        assert_eq!(store.list_events(None, Some(1)).unwrap()[0].id, "c");
        assert_eq!(store.events_for_rule("r1").len(), 2);
    }
}
