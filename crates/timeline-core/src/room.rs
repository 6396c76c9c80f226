use std::fmt;

use tracing::{debug, info, warn};

use crate::{
    error::TimelineError,
    local_echo::{LocalEchoTracker, SendState, Transition},
    members::MemberRegistry,
    normalization::{SendOutcome, normalize_send_outcome},
    record::{EventRecord, RecordKey},
    state_store::{StateStore, StateView},
    timeline::{AppendReport, PrependReport, Timeline, TimelineChange},
    types::{
        Event, EventStatus, InitialSnapshot, MEMBER_EVENT_TYPE, MemberProfile, PaginationCursor,
        RoomNotification, SendAck, StateKey, now_ms,
    },
};

/// Handle returned by [`RoomAggregate::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn Fn(&RoomNotification) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Observer)>,
}

impl Observers {
    fn add(&mut self, observer: Observer) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, observer));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn dispatch(&self, notification: &RoomNotification) {
        for (_, observer) in &self.entries {
            observer(notification);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Everything the client knows about one room.
///
/// Owns the timeline, the current state and the in-flight sends, and is the
/// only place where they are mutated together. Every mutation dispatches
/// [`RoomNotification`]s to subscribers before returning.
#[derive(Debug)]
pub struct RoomAggregate {
    room_id: String,
    own_user_id: String,
    timeline: Timeline,
    state: StateStore,
    echoes: LocalEchoTracker,
    members: MemberRegistry,
    cursor: PaginationCursor,
    observers: Observers,
}

impl RoomAggregate {
    /// Build a room from its initial snapshot.
    ///
    /// Snapshot state describes the end of the snapshot timeline, so state
    /// events inside the timeline only fill keys it does not cover.
    pub fn from_snapshot(
        own_user_id: impl Into<String>,
        snapshot: InitialSnapshot,
    ) -> (Self, AppendReport) {
        let InitialSnapshot {
            room_id,
            state: state_events,
            timeline: timeline_events,
            pagination_token,
        } = snapshot;

        let mut state = StateStore::new();
        let mut skipped = Vec::new();
        for event in state_events {
            if !event.is_state() {
                skipped.push(TimelineError::MalformedEvent {
                    event_id: event.event_id.clone(),
                    reason: "snapshot state event without state_key".to_owned(),
                });
                continue;
            }
            match event.validate_fields() {
                Ok(()) => {
                    state.apply(&event);
                }
                Err(err) => {
                    warn!(%err, room_id = %room_id, "skipping malformed snapshot state");
                    skipped.push(err);
                }
            }
        }

        let mut timeline = Timeline::new();
        let mut report = timeline.append_initial(timeline_events, &mut state);
        skipped.append(&mut report.skipped);
        report.skipped = skipped;

        let cursor = PaginationCursor::from_token(pagination_token);
        info!(
            room_id = %room_id,
            records = timeline.len(),
            state = state.len(),
            exhausted = cursor.is_exhausted(),
            "room opened"
        );

        let room = Self {
            room_id,
            own_user_id: own_user_id.into(),
            timeline,
            state,
            echoes: LocalEchoTracker::new(),
            members: MemberRegistry::new(),
            cursor,
            observers: Observers::default(),
        };
        (room, report)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn own_user_id(&self) -> &str {
        &self.own_user_id
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn current_state(&self) -> StateView {
        self.state.current()
    }

    /// State as seen by the record at `position`.
    pub fn state_at(&self, position: usize) -> StateView {
        self.state.resolve_at(&self.timeline, position)
    }

    /// Current profile of a member.
    pub fn member(&self, user_id: &str) -> Option<MemberProfile> {
        self.members.get(&self.state, user_id).cloned()
    }

    /// Sender profile of the record at `index`, as it was when it was sent.
    ///
    /// Local echoes resolve against current state. Unknown senders fall back
    /// to a profile named after their user ID.
    pub fn sender_at(&self, index: usize) -> Option<MemberProfile> {
        let record = self.timeline.get(index)?;
        let profile = if record.is_pending() {
            self.member(record.sender())
        } else {
            self.state_at(index).member(record.sender())
        };
        Some(profile.unwrap_or_else(|| MemberProfile::unknown(record.sender())))
    }

    pub fn room_name(&self) -> Option<String> {
        self.state.current().room_name().map(ToOwned::to_owned)
    }

    pub fn echo_state(&self, transaction_id: &str) -> Option<SendState> {
        self.echoes.state(transaction_id)
    }

    /// Record of a send that has not been fully reconciled yet.
    pub fn pending_record(&self, transaction_id: &str) -> Option<&EventRecord> {
        let key = self.echoes.record_key(transaction_id)?;
        self.timeline.get_by_key(key)
    }

    /// Merge one stream batch.
    ///
    /// Only an empty batch is an error; bad events are reported in
    /// [`AppendReport::skipped`].
    pub fn append_live(&mut self, events: Vec<Event>) -> Result<AppendReport, TimelineError> {
        if events.is_empty() {
            return Err(TimelineError::EmptyBatch);
        }
        let report = self
            .timeline
            .append_live(events, &mut self.echoes, &mut self.state);
        self.invalidate_members(&report.state_keys);
        for change in &report.changes {
            self.notify_change(change);
        }
        Ok(report)
    }

    /// Draft a text message authored by the local user.
    pub fn draft_text(&self, body: impl Into<String>) -> Event {
        Event::text_message(self.room_id.clone(), self.own_user_id.clone(), body)
            .with_origin_server_ts(now_ms())
    }

    /// Show a draft at the live end immediately, before any confirmation.
    pub fn append_local(
        &mut self,
        draft: Event,
        transaction_id: &str,
    ) -> Result<RecordKey, TimelineError> {
        let key = self
            .timeline
            .append_local(draft, transaction_id, &mut self.echoes)?;
        debug!(room_id = %self.room_id, transaction_id, "local echo appended");
        if let Some(index) = self.timeline.position(key) {
            self.notify(RoomNotification::TimelineAppended {
                room_id: self.room_id.clone(),
                start: index,
                count: 1,
            });
        }
        Ok(key)
    }

    pub fn send_text_local(
        &mut self,
        transaction_id: &str,
        body: impl Into<String>,
    ) -> Result<RecordKey, TimelineError> {
        let draft = self.draft_text(body);
        self.append_local(draft, transaction_id)
    }

    /// Apply the transport's answer to a send.
    ///
    /// A failure reported after the stream echo already delivered the event
    /// acknowledges the delivered copy instead.
    pub fn resolve(&mut self, transaction_id: &str, outcome: &SendOutcome) -> SendAck {
        let error = match outcome {
            SendOutcome::Success { event_id } => {
                self.apply_confirmation(transaction_id, event_id);
                return normalize_send_outcome(transaction_id, outcome);
            }
            SendOutcome::Failure { error } => error,
        };

        let delivered_id = self
            .pending_record(transaction_id)
            .filter(|record| record.status() == EventStatus::Sent)
            .and_then(|record| record.event_id().map(ToOwned::to_owned));
        match self.echoes.fail(transaction_id) {
            Transition::Applied(key) => {
                warn!(room_id = %self.room_id, transaction_id, %error, "send failed");
                self.set_pending_status(key, EventStatus::NotSent);
            }
            Transition::Ignored | Transition::Unknown => {
                debug!(transaction_id, %error, "ignoring send failure");
            }
        }
        match delivered_id {
            Some(event_id) => {
                normalize_send_outcome(transaction_id, &SendOutcome::Success { event_id })
            }
            None => normalize_send_outcome(transaction_id, outcome),
        }
    }

    /// Give up on a send that is still waiting for a response.
    ///
    /// Already settled sends are left alone.
    pub fn mark_failed(&mut self, transaction_id: &str) -> Result<(), TimelineError> {
        match self.echoes.fail(transaction_id) {
            Transition::Applied(key) => {
                self.set_pending_status(key, EventStatus::NotSent);
                Ok(())
            }
            Transition::Ignored => Ok(()),
            Transition::Unknown => Err(TimelineError::UnknownTransaction(
                transaction_id.to_owned(),
            )),
        }
    }

    /// Move a failed send back to `Sending` and return the draft to resend.
    pub fn retry(&mut self, transaction_id: &str) -> Result<Event, TimelineError> {
        let key = self.echoes.retry(transaction_id)?;
        self.set_pending_status(key, EventStatus::Sending);
        self.timeline
            .get_by_key(key)
            .map(|record| record.event().clone())
            .ok_or_else(|| TimelineError::UnknownTransaction(transaction_id.to_owned()))
    }

    /// Splice one page of history onto the old end.
    pub fn prepend_historical(
        &mut self,
        events: Vec<Event>,
        next_token: Option<String>,
    ) -> PrependReport {
        let report = self.timeline.prepend_historical(
            events,
            next_token,
            &mut self.cursor,
            &mut self.echoes,
            &mut self.state,
        );
        self.invalidate_members(&report.state_keys);
        for change in &report.changes {
            self.notify_change(change);
        }
        if report.added > 0 {
            self.notify(RoomNotification::TimelinePrepended {
                room_id: self.room_id.clone(),
                count: report.added,
            });
        }
        if report.exhausted {
            info!(room_id = %self.room_id, "reached start of room history");
        }
        report
    }

    /// Register a callback invoked synchronously for every notification.
    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: Fn(&RoomNotification) + Send + Sync + 'static,
    {
        self.observers.add(Box::new(observer))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(id)
    }

    fn apply_confirmation(&mut self, transaction_id: &str, event_id: &str) {
        let key = match self.echoes.confirm(transaction_id, event_id) {
            Transition::Applied(key) => key,
            Transition::Ignored => {
                debug!(transaction_id, event_id, "confirmation after echo is a no-op");
                return;
            }
            Transition::Unknown => {
                debug!(transaction_id, event_id, "confirmation for unknown transaction");
                return;
            }
        };

        if self.timeline.contains_event(event_id) {
            debug!(
                transaction_id,
                event_id, "server copy already present; dropping local echo"
            );
            self.echoes.retire(transaction_id);
            if let Some(change) = self.timeline.remove(key) {
                self.notify_change(&change);
            }
            return;
        }

        let Some(change) = self.timeline.confirm(key, event_id) else {
            return;
        };
        let confirmed_state = self
            .timeline
            .get_by_key(key)
            .filter(|record| record.event().is_state())
            .map(|record| record.event().clone());
        if let Some(event) = confirmed_state {
            self.state.apply(&event);
            if event.event_type == MEMBER_EVENT_TYPE {
                self.members.invalidate();
            }
        }
        self.notify_change(&change);
    }

    fn set_pending_status(&mut self, key: RecordKey, status: EventStatus) {
        if let Some(change) = self.timeline.set_pending_status(key, status) {
            self.notify_change(&change);
        }
    }

    fn invalidate_members(&mut self, keys: &[StateKey]) {
        if keys.iter().any(|key| key.event_type == MEMBER_EVENT_TYPE) {
            self.members.invalidate();
        }
    }

    fn notify_change(&self, change: &TimelineChange) {
        let room_id = self.room_id.clone();
        let notification = match change.clone() {
            TimelineChange::Inserted { start, count } => RoomNotification::TimelineAppended {
                room_id,
                start,
                count,
            },
            TimelineChange::Updated {
                key,
                index,
                event_id,
                status,
            } => RoomNotification::RecordUpdated {
                room_id,
                key,
                index,
                event_id,
                status,
            },
            TimelineChange::Removed { key, index } => RoomNotification::RecordRemoved {
                room_id,
                key,
                index,
            },
        };
        self.notify(notification);
    }

    fn notify(&self, notification: RoomNotification) {
        self.observers.dispatch(&notification);
    }
}
