use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{error::TimelineError, record::RecordKey};

/// Lifecycle of one local send.
///
/// ```text
/// Pending --confirm--> Confirmed --echo-->  (retired)
/// Pending --echo-----> EchoReceived --confirm/fail--> (retired)
/// Pending --fail-----> Failed --retry--> Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Waiting for both the send response and the stream echo.
    Pending,
    /// The send response assigned an ID; the stream echo is still due.
    Confirmed,
    /// The stream echo materialized the record; the send response is still due.
    EchoReceived,
    /// The send request failed.
    Failed,
}

/// What `append_live` should do with an event carrying a transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingEcho {
    /// No in-flight send; insert the event as an ordinary one.
    Unmatched,
    /// Update the local record in place with the server copy.
    Materialize(RecordKey),
    /// The local record already holds the server ID; drop the incoming copy.
    AlreadyMaterialized(RecordKey),
}

/// Result of applying a send response to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record needs updating.
    Applied(RecordKey),
    /// The record is already in its final form.
    Ignored,
    /// No entry for this transaction.
    Unknown,
}

#[derive(Debug, Clone)]
struct EchoEntry {
    key: RecordKey,
    state: SendState,
    event_id: Option<String>,
}

/// Index from transaction ID to the timeline record of an in-flight send.
///
/// Entries never own records; the [`crate::timeline::Timeline`] does. An entry
/// is retired once both the send response and the stream echo have been
/// seen, and a retired transaction ID can never be reused in the same room.
/// Confirmed sends are also indexed by server ID, so a stream copy that lost
/// its transaction ID still retires them.
#[derive(Debug, Clone, Default)]
pub struct LocalEchoTracker {
    entries: HashMap<String, EchoEntry>,
    by_event_id: HashMap<String, String>,
    retired: HashSet<String>,
}

impl LocalEchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new local echo.
    pub fn begin_local(&mut self, transaction_id: &str, key: RecordKey) -> Result<(), TimelineError> {
        if self.entries.contains_key(transaction_id) || self.retired.contains(transaction_id) {
            return Err(TimelineError::DuplicateTransaction(
                transaction_id.to_owned(),
            ));
        }
        self.entries.insert(
            transaction_id.to_owned(),
            EchoEntry {
                key,
                state: SendState::Pending,
                event_id: None,
            },
        );
        Ok(())
    }

    pub fn state(&self, transaction_id: &str) -> Option<SendState> {
        self.entries.get(transaction_id).map(|entry| entry.state)
    }

    pub fn record_key(&self, transaction_id: &str) -> Option<RecordKey> {
        self.entries.get(transaction_id).map(|entry| entry.key)
    }

    /// Whether the transaction ID was ever used in this room.
    pub fn is_known(&self, transaction_id: &str) -> bool {
        self.entries.contains_key(transaction_id) || self.retired.contains(transaction_id)
    }

    /// Number of sends still waiting for a response or an echo.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match a stream event's transaction ID against in-flight sends.
    pub fn reconcile_incoming(&mut self, transaction_id: &str) -> IncomingEcho {
        let Some(entry) = self.entries.get_mut(transaction_id) else {
            return IncomingEcho::Unmatched;
        };
        let (key, state) = (entry.key, entry.state);
        match state {
            SendState::Pending | SendState::Failed => {
                entry.state = SendState::EchoReceived;
                IncomingEcho::Materialize(key)
            }
            SendState::Confirmed => {
                self.retire(transaction_id);
                IncomingEcho::AlreadyMaterialized(key)
            }
            SendState::EchoReceived => IncomingEcho::AlreadyMaterialized(key),
        }
    }

    /// Apply a successful send response carrying the server ID.
    pub fn confirm(&mut self, transaction_id: &str, event_id: &str) -> Transition {
        let transition = self.transition_from_any_of(
            transaction_id,
            &[SendState::Pending, SendState::Failed],
            SendState::Confirmed,
        );
        if let Transition::Applied(_) = transition
            && let Some(entry) = self.entries.get_mut(transaction_id)
        {
            entry.event_id = Some(event_id.to_owned());
            self.by_event_id
                .insert(event_id.to_owned(), transaction_id.to_owned());
        }
        transition
    }

    /// Retire the confirmed send whose server ID is `event_id`.
    ///
    /// Returns the retired transaction ID, if any.
    pub fn retire_confirmed(&mut self, event_id: &str) -> Option<String> {
        let transaction_id = self.by_event_id.get(event_id)?.clone();
        if self.state(&transaction_id) != Some(SendState::Confirmed) {
            return None;
        }
        self.retire(&transaction_id);
        Some(transaction_id)
    }

    /// Apply a failed send response, or an explicit failure by the caller.
    pub fn fail(&mut self, transaction_id: &str) -> Transition {
        self.transition_from_any_of(transaction_id, &[SendState::Pending], SendState::Failed)
    }

    /// Move a failed send back to pending.
    pub fn retry(&mut self, transaction_id: &str) -> Result<RecordKey, TimelineError> {
        match self.entries.get_mut(transaction_id) {
            Some(entry) if entry.state == SendState::Failed => {
                entry.state = SendState::Pending;
                Ok(entry.key)
            }
            _ => Err(TimelineError::UnknownTransaction(
                transaction_id.to_owned(),
            )),
        }
    }

    /// Drop the entry for a finished transaction.
    pub fn retire(&mut self, transaction_id: &str) {
        if let Some(entry) = self.entries.remove(transaction_id) {
            if let Some(event_id) = entry.event_id {
                self.by_event_id.remove(&event_id);
            }
            self.retired.insert(transaction_id.to_owned());
        }
    }

    fn transition_from_any_of(
        &mut self,
        transaction_id: &str,
        expected: &[SendState],
        next: SendState,
    ) -> Transition {
        let Some(entry) = self.entries.get_mut(transaction_id) else {
            debug!(transaction_id, "send response for unknown transaction");
            return Transition::Unknown;
        };

        if expected.contains(&entry.state) {
            entry.state = next;
            return Transition::Applied(entry.key);
        }

        debug!(
            transaction_id,
            state = ?entry.state,
            "send response does not change a settled transaction"
        );
        if entry.state == SendState::EchoReceived {
            self.retire(transaction_id);
        }
        Transition::Ignored
    }
}
