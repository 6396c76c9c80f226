use std::collections::{BTreeMap, HashMap, hash_map::Entry};

use serde_json::Value;

use crate::{
    timeline::Timeline,
    types::{Event, MEMBER_EVENT_TYPE, MemberProfile, ROOM_NAME_EVENT_TYPE, StateKey},
};

/// Current room state keyed by `(type, state_key)`.
///
/// Writes are last-write-wins in timeline order. Historical state is never
/// stored; [`StateStore::resolve_at`] derives it by walking `prev_content`.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    entries: HashMap<StateKey, Event>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for a state event, returning the superseded event.
    ///
    /// Non-state events are ignored.
    pub fn apply(&mut self, event: &Event) -> Option<Event> {
        let key = event.state_key_pair()?;
        self.entries.insert(key, event.clone())
    }

    /// Record a state event from history only if nothing newer is known.
    ///
    /// Returns whether the store changed.
    pub fn apply_historical(&mut self, event: &Event) -> bool {
        let Some(key) = event.state_key_pair() else {
            return false;
        };
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                true
            }
        }
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.entries.get(&StateKey::new(event_type, state_key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership state events keyed by user ID.
    pub fn members(&self) -> impl Iterator<Item = (&str, &Event)> {
        self.entries
            .iter()
            .filter(|(key, _)| key.event_type == MEMBER_EVENT_TYPE)
            .map(|(key, event)| (key.state_key.as_str(), event))
    }

    /// Snapshot of the current state contents.
    pub fn current(&self) -> StateView {
        StateView {
            entries: self
                .entries
                .iter()
                .map(|(key, event)| (key.clone(), event.content.clone()))
                .collect(),
        }
    }

    /// State as it was at `position` in `timeline`.
    ///
    /// Starts from the current state and rolls back every settled state event
    /// after `position`, walking from the live end toward `position` so the
    /// event closest to `position` decides the final value. A missing or empty
    /// `prev_content` means the key did not exist yet.
    pub fn resolve_at(&self, timeline: &Timeline, position: usize) -> StateView {
        let mut view = self.current();
        for record in timeline.iter().skip(position.saturating_add(1)).rev() {
            if record.is_pending() {
                continue;
            }
            let event = record.event();
            let Some(key) = event.state_key_pair() else {
                continue;
            };
            match event.prev_content.as_ref().filter(|prev| has_fields(prev)) {
                Some(prev) => {
                    view.entries.insert(key, prev.clone());
                }
                None => {
                    view.entries.remove(&key);
                }
            }
        }
        view
    }
}

fn has_fields(content: &Value) -> bool {
    content.as_object().is_some_and(|fields| !fields.is_empty())
}

/// Immutable state mapping computed for one timeline position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateView {
    entries: BTreeMap<StateKey, Value>,
}

impl StateView {
    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Value> {
        self.entries.get(&StateKey::new(event_type, state_key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &Value)> {
        self.entries.iter()
    }

    pub fn member(&self, user_id: &str) -> Option<MemberProfile> {
        self.get(MEMBER_EVENT_TYPE, user_id)
            .map(|content| MemberProfile::from_content(user_id, content))
    }

    pub fn room_name(&self) -> Option<&str> {
        self.get(ROOM_NAME_EVENT_TYPE, "")
            .and_then(|content| content.get("name"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ROOM: &str = "!room:example.org";

    fn name_event(id: &str, name: &str, prev: Option<&str>) -> Event {
        let event = Event::new(ROOM_NAME_EVENT_TYPE, ROOM, "@bob:example.org", json!({ "name": name }))
            .with_state_key("")
            .with_event_id(id);
        match prev {
            Some(prev) => event.with_prev_content(json!({ "name": prev })),
            None => event,
        }
    }

    #[test]
    fn apply_returns_superseded_event() {
        let mut store = StateStore::new();
        assert_eq!(store.apply(&name_event("$1", "One", None)), None);

        let superseded = store
            .apply(&name_event("$2", "Two", Some("One")))
            .expect("previous value should be returned");
        assert_eq!(superseded.event_id.as_deref(), Some("$1"));
        assert_eq!(store.current().room_name(), Some("Two"));
    }

    #[test]
    fn ignores_message_events() {
        let mut store = StateStore::new();
        let message = Event::text_message(ROOM, "@bob:example.org", "hi").with_event_id("$1");
        assert_eq!(store.apply(&message), None);
        assert!(!store.apply_historical(&message));
        assert!(store.is_empty());
    }

    #[test]
    fn historical_apply_never_overwrites() {
        let mut store = StateStore::new();
        store.apply(&name_event("$2", "Current", Some("Old")));

        assert!(!store.apply_historical(&name_event("$1", "Old", None)));
        assert_eq!(store.current().room_name(), Some("Current"));
    }

    #[test]
    fn resolves_rollbacks_nearest_to_position_last() {
        let mut timeline = Timeline::new();
        let mut store = StateStore::new();
        let mut echoes = crate::local_echo::LocalEchoTracker::default();
        timeline.append_live(
            vec![
                name_event("$1", "One", None),
                name_event("$2", "Two", Some("One")),
                name_event("$3", "Three", Some("Two")),
            ],
            &mut echoes,
            &mut store,
        );

        assert_eq!(store.resolve_at(&timeline, 2).room_name(), Some("Three"));
        assert_eq!(store.resolve_at(&timeline, 1).room_name(), Some("Two"));
        assert_eq!(store.resolve_at(&timeline, 0).room_name(), Some("One"));
    }

    #[test]
    fn empty_prev_content_removes_the_key() {
        let mut timeline = Timeline::new();
        let mut store = StateStore::new();
        let mut echoes = crate::local_echo::LocalEchoTracker::default();
        let created = Event::text_message(ROOM, "@bob:example.org", "before").with_event_id("$0");
        let named = name_event("$1", "Named", None).with_prev_content(json!({}));
        timeline.append_live(vec![created, named], &mut echoes, &mut store);

        assert_eq!(store.resolve_at(&timeline, 0).room_name(), None);
        assert_eq!(store.resolve_at(&timeline, 1).room_name(), Some("Named"));
    }

    #[test]
    fn position_past_the_end_is_current_state() {
        let mut store = StateStore::new();
        store.apply(&name_event("$1", "One", None));
        let timeline = Timeline::new();
        assert_eq!(store.resolve_at(&timeline, 10), store.current());
    }
}
