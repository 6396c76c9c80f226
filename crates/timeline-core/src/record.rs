use serde::{Deserialize, Serialize};

use crate::types::{Event, EventStatus};

/// Stable handle to a timeline record.
///
/// Unlike an index, a key survives prepends and reordering of the pending tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(u64);

impl RecordKey {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One event in a room timeline plus its client-local delivery status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    key: RecordKey,
    event: Event,
    status: EventStatus,
}

impl EventRecord {
    /// Record for an event received from the server.
    pub(crate) fn remote(key: RecordKey, event: Event) -> Self {
        Self {
            key,
            event,
            status: EventStatus::Sent,
        }
    }

    /// Record for a locally authored draft awaiting confirmation.
    pub(crate) fn local(key: RecordKey, event: Event) -> Self {
        Self {
            key,
            event,
            status: EventStatus::Sending,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event.event_id.as_deref()
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn sender(&self) -> &str {
        &self.event.sender
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.event.transaction_id()
    }

    /// Whether the record still belongs to the unsettled local tail.
    pub fn is_pending(&self) -> bool {
        self.status != EventStatus::Sent
    }

    /// Assign the server ID and mark the record sent.
    ///
    /// The ID is only ever set once.
    pub(crate) fn confirm(&mut self, event_id: &str) {
        if self.event.event_id.is_none() {
            self.event.event_id = Some(event_id.to_owned());
        }
        self.status = EventStatus::Sent;
    }

    /// Replace the draft with the server copy, keeping the handle.
    pub(crate) fn materialize(&mut self, event: Event) {
        let transaction_id = self.event.unsigned.transaction_id.take();
        self.event = event;
        if self.event.unsigned.transaction_id.is_none() {
            self.event.unsigned.transaction_id = transaction_id;
        }
        self.status = EventStatus::Sent;
    }

    pub(crate) fn set_status(&mut self, status: EventStatus) {
        self.status = status;
    }
}
