use std::collections::{HashSet, VecDeque, vec_deque};

use tracing::{debug, trace, warn};

use crate::{
    error::TimelineError,
    local_echo::{IncomingEcho, LocalEchoTracker},
    record::{EventRecord, RecordKey},
    state_store::StateStore,
    types::{Event, EventStatus, PaginationCursor, StateKey},
};

const MAX_PAGINATE_LIMIT: u16 = 100;

/// Index-level change produced by a timeline mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineChange {
    /// `count` records inserted starting at `start`.
    Inserted { start: usize, count: usize },
    /// A record changed ID or status and now sits at `index`.
    Updated {
        key: RecordKey,
        index: usize,
        event_id: Option<String>,
        status: EventStatus,
    },
    /// A record was removed from `index`.
    Removed { key: RecordKey, index: usize },
}

/// Outcome of merging live (or initial) events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendReport {
    /// New records inserted.
    pub inserted: usize,
    /// Local echoes settled in place by their stream copy.
    pub reconciled: Vec<RecordKey>,
    /// State keys written to the store.
    pub state_keys: Vec<StateKey>,
    /// Events dropped without aborting the batch.
    pub skipped: Vec<TimelineError>,
    /// Index changes in application order.
    pub changes: Vec<TimelineChange>,
}

impl AppendReport {
    fn record_insert(&mut self, index: usize) {
        self.inserted += 1;
        if let Some(TimelineChange::Inserted { start, count }) = self.changes.last_mut()
            && *start + *count == index
        {
            *count += 1;
            return;
        }
        self.changes.push(TimelineChange::Inserted {
            start: index,
            count: 1,
        });
    }
}

/// Outcome of splicing one page of history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrependReport {
    /// Records added at the start of the timeline.
    pub added: usize,
    /// Local echoes settled by a copy found in history.
    pub reconciled: Vec<RecordKey>,
    /// State keys written to the store by this page.
    pub state_keys: Vec<StateKey>,
    /// Index changes to existing records, applied before the page is spliced.
    pub changes: Vec<TimelineChange>,
    /// Events dropped without aborting the page.
    pub skipped: Vec<TimelineError>,
    /// Whether the cursor reached the start of the room.
    pub exhausted: bool,
}

/// Ordered event records of one room.
///
/// Layout is `[history ..., live ..., pending tail]`: every record that is not
/// yet `Sent` (local echoes in `Sending` or `NotSent`) lives in the tail. Live
/// events are inserted in front of the tail, and a local echo that becomes
/// `Sent` moves to the end of the settled region.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    records: VecDeque<EventRecord>,
    known_ids: HashSet<String>,
    next_key: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in display order.
    pub fn iter(&self) -> vec_deque::Iter<'_, EventRecord> {
        self.records.iter()
    }

    pub fn get(&self, index: usize) -> Option<&EventRecord> {
        self.records.get(index)
    }

    pub fn get_by_key(&self, key: RecordKey) -> Option<&EventRecord> {
        self.position(key).and_then(|index| self.records.get(index))
    }

    /// Current index of a record. Pending records are found fastest.
    pub fn position(&self, key: RecordKey) -> Option<usize> {
        self.records.iter().rposition(|record| record.key() == key)
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.known_ids.contains(event_id)
    }

    /// Number of records in the pending tail.
    pub fn pending_len(&self) -> usize {
        self.records
            .iter()
            .rev()
            .take_while(|record| record.is_pending())
            .count()
    }

    /// Number of records ahead of the pending tail.
    pub fn settled_len(&self) -> usize {
        self.records.len() - self.pending_len()
    }

    /// Number of records known to be delivered.
    pub fn delivered_len(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status() == EventStatus::Sent)
            .count()
    }

    /// Merge live events in stream order.
    ///
    /// Events whose ID is already present are dropped. Events carrying the
    /// transaction ID of an in-flight local echo settle that record in place
    /// instead of being inserted. Malformed events are skipped; the rest of
    /// the batch is still applied.
    pub fn append_live(
        &mut self,
        events: Vec<Event>,
        echoes: &mut LocalEchoTracker,
        state: &mut StateStore,
    ) -> AppendReport {
        let mut report = AppendReport::default();

        for event in events {
            let event_id = match event.validate_remote() {
                Ok(event_id) => event_id.to_owned(),
                Err(err) => {
                    warn!(%err, "skipping malformed live event");
                    report.skipped.push(err);
                    continue;
                }
            };

            if self.known_ids.contains(&event_id) {
                if let Some(change) = self.absorb_known(&event, &event_id, echoes) {
                    report.changes.push(change);
                }
                debug!(%event_id, "dropping duplicate live event");
                report.skipped.push(TimelineError::DuplicateEvent(event_id));
                continue;
            }

            if let Some(transaction_id) = event.transaction_id() {
                match echoes.reconcile_incoming(transaction_id) {
                    IncomingEcho::Materialize(key) if self.position(key).is_some() => {
                        trace!(%event_id, transaction_id, "stream echo settles local echo");
                        report.state_keys.extend(apply_state(&event, state));
                        if let Some(change) = self.settle(key, |record| record.materialize(event)) {
                            report.changes.push(change);
                        }
                        report.reconciled.push(key);
                        continue;
                    }
                    IncomingEcho::Materialize(key) => {
                        warn!(
                            %event_id,
                            transaction_id,
                            key = key.get(),
                            "local echo record is gone; inserting server copy"
                        );
                    }
                    IncomingEcho::AlreadyMaterialized(_) => {
                        debug!(%event_id, transaction_id, "stream echo already settled");
                        report.skipped.push(TimelineError::DuplicateEvent(event_id));
                        continue;
                    }
                    IncomingEcho::Unmatched => {
                        debug!(
                            %event_id,
                            transaction_id, "no local echo for transaction; inserting as-is"
                        );
                    }
                }
            }

            report.state_keys.extend(apply_state(&event, state));
            self.known_ids.insert(event_id);
            let key = self.allocate_key();
            let index = self.insert_settled(EventRecord::remote(key, event));
            trace!(index, "inserted live event");
            report.record_insert(index);
        }

        report
    }

    /// Seed the timeline from an initial snapshot, oldest first.
    ///
    /// State events here only fill keys the snapshot state did not cover,
    /// newest first.
    pub fn append_initial(&mut self, events: Vec<Event>, state: &mut StateStore) -> AppendReport {
        let mut report = AppendReport::default();
        let mut state_events = Vec::new();

        for event in events {
            let event_id = match event.validate_remote() {
                Ok(event_id) => event_id.to_owned(),
                Err(err) => {
                    warn!(%err, "skipping malformed snapshot event");
                    report.skipped.push(err);
                    continue;
                }
            };
            if !self.known_ids.insert(event_id.clone()) {
                report.skipped.push(TimelineError::DuplicateEvent(event_id));
                continue;
            }
            if event.is_state() {
                state_events.push(event.clone());
            }
            let key = self.allocate_key();
            let index = self.insert_settled(EventRecord::remote(key, event));
            report.record_insert(index);
        }

        for event in state_events.iter().rev() {
            if state.apply_historical(event)
                && let Some(key) = event.state_key_pair()
            {
                report.state_keys.push(key);
            }
        }

        report
    }

    /// Append a local draft to the live end with status `Sending`.
    pub fn append_local(
        &mut self,
        mut draft: Event,
        transaction_id: &str,
        echoes: &mut LocalEchoTracker,
    ) -> Result<RecordKey, TimelineError> {
        draft.validate_fields()?;
        let key = self.allocate_key();
        echoes.begin_local(transaction_id, key)?;

        draft.event_id = None;
        draft.unsigned.transaction_id = Some(transaction_id.to_owned());
        self.records.push_back(EventRecord::local(key, draft));
        Ok(key)
    }

    /// Splice one page of history, given newest first, onto the old end.
    ///
    /// State events only fill keys with no known value. A copy of an
    /// in-flight send settles its local echo instead of being inserted. An
    /// empty page or a missing `next_token` exhausts the cursor for good.
    pub fn prepend_historical(
        &mut self,
        events: Vec<Event>,
        next_token: Option<String>,
        cursor: &mut PaginationCursor,
        echoes: &mut LocalEchoTracker,
        state: &mut StateStore,
    ) -> PrependReport {
        let mut report = PrependReport::default();
        let reached_start = events.is_empty();
        let mut older = Vec::with_capacity(events.len());

        // Echoes settle before the splice so change indices stay valid.
        for event in events {
            let event_id = match event.validate_remote() {
                Ok(event_id) => event_id.to_owned(),
                Err(err) => {
                    warn!(%err, "skipping malformed history event");
                    report.skipped.push(err);
                    continue;
                }
            };
            if self.known_ids.contains(&event_id) {
                if let Some(change) = self.absorb_known(&event, &event_id, echoes) {
                    report.changes.push(change);
                }
                debug!(%event_id, "dropping duplicate history event");
                report.skipped.push(TimelineError::DuplicateEvent(event_id));
                continue;
            }

            if let Some(transaction_id) = event.transaction_id() {
                match echoes.reconcile_incoming(transaction_id) {
                    IncomingEcho::Materialize(key) if self.position(key).is_some() => {
                        trace!(%event_id, transaction_id, "history copy settles local echo");
                        report.state_keys.extend(apply_state(&event, state));
                        if let Some(change) = self.settle(key, |record| record.materialize(event)) {
                            report.changes.push(change);
                        }
                        report.reconciled.push(key);
                        continue;
                    }
                    IncomingEcho::AlreadyMaterialized(_) => {
                        debug!(%event_id, transaction_id, "history copy of a settled send");
                        report.skipped.push(TimelineError::DuplicateEvent(event_id));
                        continue;
                    }
                    IncomingEcho::Materialize(_) | IncomingEcho::Unmatched => {}
                }
            }

            self.known_ids.insert(event_id);
            older.push(event);
        }

        for event in older {
            if state.apply_historical(&event)
                && let Some(key) = event.state_key_pair()
            {
                report.state_keys.push(key);
            }
            let key = self.allocate_key();
            self.records.push_front(EventRecord::remote(key, event));
            report.added += 1;
        }

        cursor.advance(if reached_start { None } else { next_token });
        report.exhausted = cursor.is_exhausted();
        report
    }

    /// Assign the server ID to a local echo and settle it.
    pub(crate) fn confirm(&mut self, key: RecordKey, event_id: &str) -> Option<TimelineChange> {
        self.settle(key, |record| record.confirm(event_id))
    }

    /// Change the status of a record that stays in the pending tail.
    pub(crate) fn set_pending_status(
        &mut self,
        key: RecordKey,
        status: EventStatus,
    ) -> Option<TimelineChange> {
        let index = self.position(key)?;
        let record = self.records.get_mut(index)?;
        record.set_status(status);
        Some(TimelineChange::Updated {
            key,
            index,
            event_id: record.event_id().map(ToOwned::to_owned),
            status,
        })
    }

    /// Reconcile echo bookkeeping for an event whose ID is already present.
    fn absorb_known(
        &mut self,
        event: &Event,
        event_id: &str,
        echoes: &mut LocalEchoTracker,
    ) -> Option<TimelineChange> {
        let mut change = None;
        if let Some(transaction_id) = event.transaction_id()
            && let IncomingEcho::Materialize(key) = echoes.reconcile_incoming(transaction_id)
        {
            // Server copy already arrived without a transaction ID.
            echoes.retire(transaction_id);
            change = self.remove(key);
        }
        if let Some(transaction_id) = echoes.retire_confirmed(event_id) {
            debug!(event_id, %transaction_id, "server copy retires confirmed send");
        }
        change
    }

    pub(crate) fn remove(&mut self, key: RecordKey) -> Option<TimelineChange> {
        let index = self.position(key)?;
        self.records.remove(index)?;
        Some(TimelineChange::Removed { key, index })
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(MAX_PAGINATE_LIMIT)
    }

    fn settle(
        &mut self,
        key: RecordKey,
        update: impl FnOnce(&mut EventRecord),
    ) -> Option<TimelineChange> {
        let from = self.position(key)?;
        let mut record = self.records.remove(from)?;
        update(&mut record);

        let event_id = record.event_id().map(ToOwned::to_owned);
        if let Some(event_id) = &event_id {
            self.known_ids.insert(event_id.clone());
        }
        let status = record.status();
        let index = self.insert_settled(record);
        Some(TimelineChange::Updated {
            key,
            index,
            event_id,
            status,
        })
    }

    fn insert_settled(&mut self, record: EventRecord) -> usize {
        let index = self.settled_len();
        self.records.insert(index, record);
        index
    }

    fn allocate_key(&mut self) -> RecordKey {
        self.next_key += 1;
        RecordKey::new(self.next_key)
    }
}

fn apply_state(event: &Event, state: &mut StateStore) -> Option<StateKey> {
    let key = event.state_key_pair()?;
    state.apply(event);
    Some(key)
}
