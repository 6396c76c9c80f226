use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use timeline_core::{
    Event, HistoryChunk, InitialSnapshot, RoomBatch, StateKey, TransportError,
    TransportErrorCategory,
};
use tokio::sync::Mutex;

use crate::transport::Transport;

const DEFAULT_SNAPSHOT_LIMIT: usize = 10;

#[derive(Debug, Default)]
struct LoopbackRoom {
    events: Vec<Event>,
    state: HashMap<StateKey, Event>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    rooms: HashMap<String, LoopbackRoom>,
    stream: VecDeque<RoomBatch>,
    next_event: u64,
}

impl LoopbackState {
    fn room_mut(&mut self, room_id: &str) -> Result<&mut LoopbackRoom, TransportError> {
        self.rooms.get_mut(room_id).ok_or_else(|| unknown_room(room_id))
    }

    /// Store an event the way a homeserver would and queue it for the stream.
    fn commit(&mut self, room_id: &str, mut event: Event) -> Result<String, TransportError> {
        self.next_event += 1;
        let event_id = format!("$loopback{}", self.next_event);
        let origin_server_ts = self.next_event;

        let room = self.room_mut(room_id)?;
        event.event_id = Some(event_id.clone());
        event.room_id = room_id.to_owned();
        if event.origin_server_ts == 0 {
            event.origin_server_ts = origin_server_ts;
        }
        if let Some(key) = event.state_key_pair() {
            event.prev_content = room.state.get(&key).map(|prev| prev.content.clone());
            room.state.insert(key, event.clone());
        }
        room.events.push(event.clone());

        match self.stream.back_mut() {
            Some(batch) if batch.room_id == room_id => batch.events.push(event),
            _ => self.stream.push_back(RoomBatch {
                room_id: room_id.to_owned(),
                events: vec![event],
            }),
        }
        Ok(event_id)
    }
}

/// In-memory homeserver for local runs and tests.
///
/// Sent events are echoed on the stream with their transaction ID, and
/// history tokens are plain event offsets.
#[derive(Debug)]
pub struct LoopbackTransport {
    user_id: String,
    snapshot_limit: usize,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Number of recent events included in a room snapshot.
    pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
        self.snapshot_limit = limit;
        self
    }

    /// Create a room with the given initial state events.
    pub async fn create_room(
        &self,
        room_id: &str,
        initial_state: Vec<Event>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.rooms.entry(room_id.to_owned()).or_default();
        for event in initial_state {
            state.commit(room_id, event)?;
        }
        Ok(())
    }

    /// Add an event from another user, as if it arrived at the server.
    pub async fn inject(&self, room_id: &str, event: Event) -> Result<String, TransportError> {
        self.state.lock().await.commit(room_id, event)
    }

    /// Drop queued stream batches, for example after taking a snapshot.
    pub async fn clear_stream(&self) {
        self.state.lock().await.stream.clear();
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn fetch_initial_snapshot(
        &self,
        room_id: &str,
    ) -> Result<InitialSnapshot, TransportError> {
        let mut state = self.state.lock().await;
        let room = state.room_mut(room_id)?;
        let start = room.events.len().saturating_sub(self.snapshot_limit);
        Ok(InitialSnapshot {
            room_id: room_id.to_owned(),
            state: room.state.values().cloned().collect(),
            timeline: room.events[start..].to_vec(),
            pagination_token: (start > 0).then(|| start.to_string()),
        })
    }

    async fn poll_stream(&self) -> Result<Vec<RoomBatch>, TransportError> {
        Ok(self.state.lock().await.stream.drain(..).collect())
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        transaction_id: &str,
    ) -> Result<String, TransportError> {
        let event = Event::new(event_type, room_id, self.user_id.clone(), content)
            .with_transaction_id(transaction_id);
        self.state.lock().await.commit(room_id, event)
    }

    async fn fetch_history(
        &self,
        room_id: &str,
        from_token: &str,
        limit: u16,
    ) -> Result<HistoryChunk, TransportError> {
        let end = from_token.parse::<usize>().map_err(|err| {
            TransportError::new(
                TransportErrorCategory::Serialization,
                "invalid_token",
                format!("bad pagination token '{from_token}': {err}"),
            )
        })?;

        let mut state = self.state.lock().await;
        let room = state.room_mut(room_id)?;
        let end = end.min(room.events.len());
        let start = end.saturating_sub(usize::from(limit));
        Ok(HistoryChunk {
            events: room.events[start..end].iter().rev().cloned().collect(),
            next_token: (start > 0).then(|| start.to_string()),
        })
    }
}

fn unknown_room(room_id: &str) -> TransportError {
    TransportError::new(
        TransportErrorCategory::Config,
        "unknown_room",
        format!("room '{room_id}' does not exist"),
    )
}
