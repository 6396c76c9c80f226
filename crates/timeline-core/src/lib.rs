//! Room timeline merge engine.
//!
//! This crate keeps one room's events in order while live sync batches,
//! backward pagination pages and the user's own sends arrive in any
//! interleaving. It owns deduplication, local echo reconciliation, current
//! state and point-in-time state rollback. It does no I/O.

/// Stable error types and HTTP classification helpers.
pub mod error;
/// Lazily cached member profiles.
pub mod members;
/// Send outcome normalization.
pub mod normalization;
/// Per-send local echo state machine.
pub mod local_echo;
/// Timeline records and their stable handles.
pub mod record;
/// Per-room composition root and subscriptions.
pub mod room;
/// Current room state and rollback.
pub mod state_store;
/// Ordered timeline with live, local and historical insertion.
pub mod timeline;
/// Wire events and shared payload types.
pub mod types;

pub use error::{TimelineError, TransportError, TransportErrorCategory};
pub use local_echo::{IncomingEcho, LocalEchoTracker, SendState, Transition};
pub use members::MemberRegistry;
pub use normalization::{SendOutcome, normalize_send_outcome};
pub use record::{EventRecord, RecordKey};
pub use room::{RoomAggregate, SubscriptionId};
pub use state_store::{StateStore, StateView};
pub use timeline::{AppendReport, PrependReport, Timeline, TimelineChange};
pub use types::{
    Event, EventStatus, HistoryChunk, InitialSnapshot, MEMBER_EVENT_TYPE, MESSAGE_EVENT_TYPE,
    MemberProfile, PaginationCursor, ROOM_NAME_EVENT_TYPE, RoomBatch, RoomNotification,
    ScrollbackResult, SendAck, StateKey, Unsigned,
};
