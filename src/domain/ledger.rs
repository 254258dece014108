//! Event ledger: the deduplicating state machine behind alert events.
//!
//! Each rule owns one slot holding its current OPEN or ACKNOWLEDGED event,
//! if any. Every transition for a rule happens while that slot's lock is
//! held and the event sink is written before the slot changes, so a failed
//! write leaves the rule exactly as it was.
//!
//! The sink is the source of truth. Before acting, the slot is re-read from
//! it so that an acknowledgement or resolution made by another process is
//! adopted rather than overwritten.
//!
//! NONE         + triggered     -> OPEN (new id)
//! OPEN | ACK   + triggered     -> same state, observation refreshed
//! OPEN | ACK   + not triggered -> RESOLVED, slot cleared
//! NONE         + not triggered -> nothing

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::error::{EvaluationError, QcwatchError};
use crate::domain::evaluator::CandidateSignal;
use crate::domain::event::{AlertEvent, EventState, Transition};
use crate::domain::rule::AlertRule;
use crate::ports::event_port::EventPort;

type Slot = Arc<Mutex<Option<AlertEvent>>>;

pub struct EventLedger {
    sink: Arc<dyn EventPort>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl EventLedger {
    /// An empty ledger writing to `sink`.
    pub fn new(sink: Arc<dyn EventPort>) -> Self {
        Self {
            sink,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the keyed store from the sink's active events. If the sink
    /// holds more than one active event for a rule, the newest one wins and
    /// the rest are resolved.
    pub fn load(sink: Arc<dyn EventPort>, at: DateTime<Utc>) -> Result<Self, QcwatchError> {
        let mut active = sink.load_active_events()?;
        active.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));

        let mut current: HashMap<String, AlertEvent> = HashMap::new();
        for event in active {
            if let Some(older) = current.insert(event.rule_id.clone(), event) {
                warn!(
                    rule_id = %older.rule_id,
                    event_id = %older.id,
                    "duplicate active event, resolving older one"
                );
                sink.upsert_event(&older.resolved(at))?;
            }
        }

        let slots = current
            .into_iter()
            .map(|(rule_id, event)| (rule_id, Arc::new(Mutex::new(Some(event)))))
            .collect();
        Ok(Self {
            sink,
            slots: Mutex::new(slots),
        })
    }

    fn slot(&self, rule_id: &str) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(rule_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    fn write(&self, event: &AlertEvent) -> Result<(), EvaluationError> {
        self.sink
            .upsert_event(event)
            .map_err(|e| EvaluationError::Storage {
                reason: e.to_string(),
            })
    }

    /// Replace the slot's copy with what the sink currently holds for the rule.
    fn refresh(&self, rule_id: &str, current: &mut Option<AlertEvent>) -> Result<(), QcwatchError> {
        if let Some(held) = current.as_ref() {
            match self.sink.get_event(&held.id)? {
                Some(stored) if stored.is_active() => {
                    *current = Some(stored);
                    return Ok(());
                }
                _ => {
                    debug!(rule_id, event_id = %held.id, "held event no longer active in store");
                    *current = None;
                }
            }
        }
        *current = self.sink.active_event_for_rule(rule_id)?;
        Ok(())
    }

    /// Apply one candidate signal to its rule's slot as a single atomic step.
    pub fn apply(
        &self,
        rule: &AlertRule,
        candidate: &CandidateSignal,
        at: DateTime<Utc>,
    ) -> Result<Transition, EvaluationError> {
        let slot = self.slot(&rule.id);
        let mut current = slot.lock();
        self.refresh(&rule.id, &mut current)
            .map_err(|e| EvaluationError::Storage {
                reason: e.to_string(),
            })?;

        let transition = match (current.as_ref(), candidate.triggered) {
            (None, true) => {
                let event = AlertEvent::open(rule, candidate, at);
                self.write(&event)?;
                info!(rule_id = %rule.id, event_id = %event.id, "alert opened");
                *current = Some(event.clone());
                Transition::Opened(event)
            }
            (Some(existing), true) => {
                let event = existing.refreshed(candidate, at);
                self.write(&event)?;
                debug!(rule_id = %rule.id, event_id = %event.id, state = %event.state, "alert refreshed");
                *current = Some(event.clone());
                Transition::Updated(event)
            }
            (Some(existing), false) => {
                let event = existing.refreshed(candidate, at).resolved(at);
                self.write(&event)?;
                info!(rule_id = %rule.id, event_id = %event.id, "alert auto-resolved");
                *current = None;
                Transition::Resolved(event)
            }
            (None, false) => Transition::Unchanged,
        };
        Ok(transition)
    }

    /// The current non-terminal event for a rule.
    pub fn active_event(&self, rule_id: &str) -> Option<AlertEvent> {
        let slot = self.slots.lock().get(rule_id).cloned()?;
        let current = slot.lock();
        current.clone()
    }

    pub fn active_events(&self) -> Vec<AlertEvent> {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        let mut events: Vec<AlertEvent> = slots.iter().filter_map(|s| s.lock().clone()).collect();
        events.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        events
    }

    pub fn acknowledge(&self, event_id: &str, note: Option<String>) -> Result<AlertEvent, QcwatchError> {
        self.manual(event_id, "acknowledged", |event| event.acknowledged(note))
    }

    pub fn resolve(&self, event_id: &str, at: DateTime<Utc>) -> Result<AlertEvent, QcwatchError> {
        self.manual(event_id, "resolved", |event| event.resolved(at))
    }

    /// External acknowledge/resolve action, serialized with candidate
    /// application through the owning rule's slot.
    fn manual(
        &self,
        event_id: &str,
        action: &str,
        change: impl FnOnce(&AlertEvent) -> AlertEvent,
    ) -> Result<AlertEvent, QcwatchError> {
        let stored = self
            .sink
            .get_event(event_id)?
            .ok_or_else(|| QcwatchError::EventNotFound {
                event_id: event_id.to_string(),
            })?;

        let slot = self.slot(&stored.rule_id);
        let mut current = slot.lock();

        // re-read under the lock; the slot copy may be stale
        let event = self
            .sink
            .get_event(event_id)?
            .ok_or_else(|| QcwatchError::EventNotFound {
                event_id: event_id.to_string(),
            })?;
        if event.state == EventState::Resolved {
            return Err(QcwatchError::InvalidTransition {
                event_id: event_id.to_string(),
                state: event.state.to_string(),
                action: action.to_string(),
            });
        }

        let updated = change(&event);
        self.sink.upsert_event(&updated)?;
        info!(rule_id = %updated.rule_id, event_id = %updated.id, state = %updated.state, "alert {}", action);

        let holds_event = current.as_ref().is_some_and(|active| active.id == event_id);
        if holds_event {
            *current = updated.is_active().then(|| updated.clone());
        } else if current.is_none() && updated.is_active() {
            *current = Some(updated.clone());
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_event_store::MemoryEventStore;
    use crate::domain::rule::RuleDefinition;
    use chrono::{NaiveDate, TimeZone};

    struct FailingSink;

    impl EventPort for FailingSink {
        fn upsert_event(&self, _event: &AlertEvent) -> Result<(), QcwatchError> {
            Err(QcwatchError::Database {
                reason: "disk full".into(),
            })
        }
        fn load_active_events(&self) -> Result<Vec<AlertEvent>, QcwatchError> {
            Ok(Vec::new())
        }
        fn get_event(&self, _event_id: &str) -> Result<Option<AlertEvent>, QcwatchError> {
            Ok(None)
        }
        fn list_events(
            &self,
            _state: Option<EventState>,
            _limit: Option<usize>,
        ) -> Result<Vec<AlertEvent>, QcwatchError> {
            Ok(Vec::new())
        }
    }

    fn rule() -> AlertRule {
        AlertRule::from_definition(
            &RuleDefinition::new("r1", "TTF", "price_threshold").with_param("threshold", 25),
        )
        .unwrap()
    }

    fn candidate(triggered: bool, value: f64) -> CandidateSignal {
        CandidateSignal {
            rule_id: "r1".into(),
            triggered,
            observed_value: Some(value),
            as_of_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            message: String::new(),
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 18, 0, 0).unwrap()
    }

    #[test]
    fn open_refresh_resolve() {
        let store = Arc::new(MemoryEventStore::new());
        let ledger = EventLedger::new(store.clone());
        let rule = rule();

        let opened = match ledger.apply(&rule, &candidate(true, 30.0), at(1)).unwrap() {
            Transition::Opened(e) => e,
            other => panic!("expected open, got {other:?}"),
        };
        let updated = match ledger.apply(&rule, &candidate(true, 31.0), at(2)).unwrap() {
            Transition::Updated(e) => e,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(updated.id, opened.id);
        assert_eq!(updated.opened_at, at(1));
        assert_eq!(updated.last_observed_value, Some(31.0));

        let resolved = match ledger.apply(&rule, &candidate(false, 20.0), at(3)).unwrap() {
            Transition::Resolved(e) => e,
            other => panic!("expected resolve, got {other:?}"),
        };
        assert_eq!(resolved.id, opened.id);
        assert_eq!(resolved.resolved_at, Some(at(3)));
        assert!(ledger.active_event("r1").is_none());
        assert_eq!(
            ledger.apply(&rule, &candidate(false, 20.0), at(4)).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn retrigger_after_resolve_opens_new_event() {
        let store = Arc::new(MemoryEventStore::new());
        let ledger = EventLedger::new(store.clone());
        let rule = rule();

        ledger.apply(&rule, &candidate(true, 30.0), at(1)).unwrap();
        ledger.apply(&rule, &candidate(false, 20.0), at(2)).unwrap();
        ledger.apply(&rule, &candidate(true, 30.0), at(3)).unwrap();

        let history = store.events_for_rule("r1");
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].id, history[1].id);
        assert_eq!(history[0].state, EventState::Resolved);
        assert_eq!(history[1].state, EventState::Open);
        assert_eq!(history[1].opened_at, at(3));
    }

    #[test]
    fn acknowledgement_is_sticky_while_triggered() {
        let store = Arc::new(MemoryEventStore::new());
        let ledger = EventLedger::new(store.clone());
        let rule = rule();

        let opened = ledger.apply(&rule, &candidate(true, 30.0), at(1)).unwrap();
        let id = opened.event().unwrap().id.clone();
        ledger.acknowledge(&id, Some("checking feed".into())).unwrap();

        let refreshed = ledger.apply(&rule, &candidate(true, 32.0), at(2)).unwrap();
        let event = refreshed.event().unwrap();
        assert_eq!(event.state, EventState::Acknowledged);
        assert_eq!(event.ack_note.as_deref(), Some("checking feed"));

        match ledger.apply(&rule, &candidate(false, 20.0), at(3)).unwrap() {
            Transition::Resolved(e) => assert_eq!(e.id, id),
            other => panic!("expected resolve, got {other:?}"),
        }
    }

    #[test]
    fn manual_resolve_frees_the_slot() {
        let store = Arc::new(MemoryEventStore::new());
        let ledger = EventLedger::new(store.clone());
        let rule = rule();

        let first = ledger.apply(&rule, &candidate(true, 30.0), at(1)).unwrap();
        let id = first.event().unwrap().id.clone();
        let resolved = ledger.resolve(&id, at(2)).unwrap();
        assert_eq!(resolved.state, EventState::Resolved);
        assert!(ledger.active_event("r1").is_none());

        // still triggered on the next run: a new event opens
        match ledger.apply(&rule, &candidate(true, 30.0), at(3)).unwrap() {
            Transition::Opened(e) => assert_ne!(e.id, id),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn resolved_events_reject_manual_actions() {
        let store = Arc::new(MemoryEventStore::new());
        let ledger = EventLedger::new(store.clone());
        let rule = rule();

        let id = ledger
            .apply(&rule, &candidate(true, 30.0), at(1))
            .unwrap()
            .event()
            .unwrap()
            .id
            .clone();
        ledger.resolve(&id, at(2)).unwrap();
        assert!(matches!(
            ledger.acknowledge(&id, None),
            Err(QcwatchError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.resolve("missing", at(3)),
            Err(QcwatchError::EventNotFound { .. })
        ));
    }

    #[test]
    fn resolution_by_another_ledger_is_terminal() {
        let store = Arc::new(MemoryEventStore::new());
        let watcher = EventLedger::new(store.clone());
        let rule = rule();

        let id = watcher
            .apply(&rule, &candidate(true, 30.0), at(1))
            .unwrap()
            .event()
            .unwrap()
            .id
            .clone();

        let operator = EventLedger::load(store.clone(), at(2)).unwrap();
        operator.resolve(&id, at(2)).unwrap();

        match watcher.apply(&rule, &candidate(true, 31.0), at(3)).unwrap() {
            Transition::Opened(e) => assert_ne!(e.id, id),
            other => panic!("expected open, got {other:?}"),
        }
        let history = store.events_for_rule("r1");
        assert_eq!(history.len(), 2);
        assert_eq!(store.get_event(&id).unwrap().unwrap().state, EventState::Resolved);
        assert_eq!(store.get_event(&id).unwrap().unwrap().resolved_at, Some(at(2)));
    }

    #[test]
    fn acknowledgement_by_another_ledger_is_kept() {
        let store = Arc::new(MemoryEventStore::new());
        let watcher = EventLedger::new(store.clone());
        let rule = rule();

        let id = watcher
            .apply(&rule, &candidate(true, 30.0), at(1))
            .unwrap()
            .event()
            .unwrap()
            .id
            .clone();
        EventLedger::load(store.clone(), at(2))
            .unwrap()
            .acknowledge(&id, Some("on it".into()))
            .unwrap();

        let event = watcher
            .apply(&rule, &candidate(true, 31.0), at(3))
            .unwrap()
            .event()
            .unwrap()
            .clone();
        assert_eq!(event.id, id);
        assert_eq!(event.state, EventState::Acknowledged);
        assert_eq!(event.ack_note.as_deref(), Some("on it"));
        assert_eq!(store.get_event(&id).unwrap().unwrap().state, EventState::Acknowledged);
    }

    #[test]
    fn event_opened_by_another_ledger_is_adopted() {
        let store = Arc::new(MemoryEventStore::new());
        let first = EventLedger::new(store.clone());
        let second = EventLedger::new(store.clone());
        let rule = rule();

        let opened = first.apply(&rule, &candidate(true, 30.0), at(1)).unwrap();
        match second.apply(&rule, &candidate(true, 31.0), at(1)).unwrap() {
            Transition::Updated(e) => assert_eq!(e.id, opened.event().unwrap().id),
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_write_leaves_slot_unchanged() {
        let ledger = EventLedger::new(Arc::new(FailingSink));
        let err = ledger.apply(&rule(), &candidate(true, 30.0), at(1)).unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(ledger.active_event("r1").is_none());
    }

    #[test]
    fn load_restores_active_events_and_collapses_duplicates() {
        let rule = rule();
        let a = AlertEvent::open(&rule, &candidate(true, 30.0), at(1));
        let b = AlertEvent::open(&rule, &candidate(true, 31.0), at(2));
        let store = Arc::new(MemoryEventStore::with_events([a.clone(), b.clone()]));

        let ledger = EventLedger::load(store.clone(), at(3)).unwrap();
        assert_eq!(ledger.active_event("r1").unwrap().id, b.id);
        assert_eq!(store.get_event(&a.id).unwrap().unwrap().state, EventState::Resolved);

        match ledger.apply(&rule, &candidate(true, 32.0), at(3)).unwrap() {
            Transition::Updated(e) => assert_eq!(e.id, b.id),
            other => panic!("expected update, got {other:?}"),
        }
    }
}
