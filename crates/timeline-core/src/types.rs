use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{error::TimelineError, record::RecordKey};

/// Event type used for room messages.
pub const MESSAGE_EVENT_TYPE: &str = "m.room.message";
/// Event type used for membership state.
pub const MEMBER_EVENT_TYPE: &str = "m.room.member";
/// Event type used for the room name state.
pub const ROOM_NAME_EVENT_TYPE: &str = "m.room.name";

/// Client-local delivery status of a timeline record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventStatus {
    /// Locally authored and waiting for the server to confirm it.
    Sending,
    /// Confirmed by the server, or received from it.
    Sent,
    /// The send request failed. The record stays visible for retry.
    NotSent,
}

/// Metadata outside the signed event body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unsigned {
    /// Transaction ID, only present on events authored by this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Unsigned {
    fn is_empty(&self) -> bool {
        self.transaction_id.is_none()
    }
}

/// One room event as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Server-assigned event ID. Absent on unconfirmed local drafts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Event type, for example `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Room the event belongs to.
    pub room_id: String,
    /// Sender user ID.
    pub sender: String,
    /// Event payload.
    #[serde(default)]
    pub content: Value,
    /// Previous value of the same state key (state events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<Value>,
    /// State key. Its presence marks the event as a state event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Origin timestamp in milliseconds since Unix epoch.
    #[serde(default)]
    pub origin_server_ts: u64,
    /// Unsigned metadata.
    #[serde(default, skip_serializing_if = "Unsigned::is_empty")]
    pub unsigned: Unsigned,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            content,
            prev_content: None,
            state_key: None,
            origin_server_ts: 0,
            unsigned: Unsigned::default(),
        }
    }

    /// Plain-text `m.room.message` event.
    pub fn text_message(
        room_id: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        Self::new(
            MESSAGE_EVENT_TYPE,
            room_id,
            sender,
            json!({ "msgtype": "m.text", "body": body }),
        )
    }

    /// `m.room.member` state event for `user_id`.
    pub fn membership(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        membership: &str,
        display_name: Option<&str>,
    ) -> Self {
        let user_id = user_id.into();
        let mut content = json!({ "membership": membership });
        if let Some(name) = display_name {
            content["displayname"] = Value::from(name);
        }
        Self::new(MEMBER_EVENT_TYPE, room_id, user_id.clone(), content).with_state_key(user_id)
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn with_prev_content(mut self, prev_content: Value) -> Self {
        self.prev_content = Some(prev_content);
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.unsigned.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_origin_server_ts(mut self, origin_server_ts: u64) -> Self {
        self.origin_server_ts = origin_server_ts;
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// `(type, state_key)` pair for state events.
    pub fn state_key_pair(&self) -> Option<StateKey> {
        self.state_key
            .as_ref()
            .map(|state_key| StateKey::new(self.event_type.clone(), state_key.clone()))
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned.transaction_id.as_deref()
    }

    /// Text body for message events.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }

    /// Check the fields every event delivered by the server must carry and
    /// return its event ID.
    pub fn validate_remote(&self) -> Result<&str, TimelineError> {
        let event_id = match self.event_id.as_deref() {
            Some(event_id) if !event_id.is_empty() => event_id,
            _ => return Err(self.malformed("missing event_id")),
        };
        self.validate_fields()?;
        Ok(event_id)
    }

    pub(crate) fn validate_fields(&self) -> Result<(), TimelineError> {
        if self.event_type.is_empty() {
            return Err(self.malformed("missing type"));
        }
        if self.sender.is_empty() {
            return Err(self.malformed("missing sender"));
        }
        if self.is_state() && !self.content.is_object() {
            return Err(self.malformed("state content is not an object"));
        }
        Ok(())
    }

    fn malformed(&self, reason: &str) -> TimelineError {
        TimelineError::MalformedEvent {
            event_id: self.event_id.clone(),
            reason: reason.to_owned(),
        }
    }
}

/// Key of one piece of room state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

/// Room snapshot delivered once at session start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialSnapshot {
    pub room_id: String,
    /// Current room state at the end of `timeline`.
    #[serde(default)]
    pub state: Vec<Event>,
    /// Most recent events, oldest first.
    #[serde(default)]
    pub timeline: Vec<Event>,
    /// Token to paginate backward from the start of `timeline`.
    pub pagination_token: Option<String>,
}

/// Events for one room from one stream poll, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomBatch {
    pub room_id: String,
    pub events: Vec<Event>,
}

/// One page of backward history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryChunk {
    /// Events newest first.
    pub events: Vec<Event>,
    /// Token for the next page, `None` when the start of the room was reached.
    pub next_token: Option<String>,
}

/// How far back history has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationCursor {
    /// More history may exist before this token.
    Backward(String),
    /// Start of the room reached. Terminal.
    Exhausted,
}

impl PaginationCursor {
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            Some(token) => Self::Backward(token),
            None => Self::Exhausted,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Backward(token) => Some(token),
            Self::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }

    /// Move to `next`. An exhausted cursor stays exhausted.
    pub fn advance(&mut self, next: Option<String>) {
        if self.is_exhausted() {
            return;
        }
        *self = Self::from_token(next);
    }
}

/// Resolved profile of a room member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberProfile {
    pub user_id: String,
    pub membership: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl MemberProfile {
    /// Profile for a user with no membership state.
    pub fn unknown(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            membership: None,
            display_name: None,
            avatar_url: None,
        }
    }

    /// Build from `m.room.member` content.
    pub fn from_content(user_id: impl Into<String>, content: &Value) -> Self {
        let field = |name: &str| {
            content
                .get(name)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        };
        Self {
            user_id: user_id.into(),
            membership: field("membership"),
            display_name: field("displayname"),
            avatar_url: field("avatar_url"),
        }
    }

    /// Display name, falling back to the user ID.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

/// Change notification dispatched to room subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomNotification {
    /// A record's ID or status changed.
    RecordUpdated {
        room_id: String,
        key: RecordKey,
        index: usize,
        event_id: Option<String>,
        status: EventStatus,
    },
    /// A local echo was dropped because the server copy is already present.
    RecordRemoved {
        room_id: String,
        key: RecordKey,
        index: usize,
    },
    /// `count` records were inserted starting at `start`.
    TimelineAppended {
        room_id: String,
        start: usize,
        count: usize,
    },
    /// `count` records were inserted at the start of the timeline.
    TimelinePrepended { room_id: String, count: usize },
}

impl RoomNotification {
    pub fn room_id(&self) -> &str {
        match self {
            Self::RecordUpdated { room_id, .. }
            | Self::RecordRemoved { room_id, .. }
            | Self::TimelineAppended { room_id, .. }
            | Self::TimelinePrepended { room_id, .. } => room_id,
        }
    }
}

/// Acknowledgement for one send transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Client transaction ID.
    pub transaction_id: String,
    /// Event ID on success.
    pub event_id: Option<String>,
    /// Stable transport error code on failure.
    pub error_code: Option<String>,
}

/// Result of one scrollback request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrollbackResult {
    /// Records added to the start of the timeline.
    pub added: usize,
    /// Whether the start of the room has been reached.
    pub exhausted: bool,
}

impl ScrollbackResult {
    /// Empty result for a room whose history is already fully loaded.
    pub fn at_start() -> Self {
        Self {
            added: 0,
            exhausted: true,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
