use async_trait::async_trait;
use serde_json::Value;
use timeline_core::{HistoryChunk, InitialSnapshot, RoomBatch, TransportError};

/// Session collaborator that talks to the homeserver.
///
/// Implementations own timeouts and retries; every call here is a single
/// attempt from the room drivers' point of view.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current state, recent events and a backward token for one room.
    async fn fetch_initial_snapshot(&self, room_id: &str)
    -> Result<InitialSnapshot, TransportError>;

    /// Next batches from the live stream, in arrival order.
    async fn poll_stream(&self) -> Result<Vec<RoomBatch>, TransportError>;

    /// Send one event and return the server-assigned event ID.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        transaction_id: &str,
    ) -> Result<String, TransportError>;

    /// One page of history before `from_token`, newest first.
    async fn fetch_history(
        &self,
        room_id: &str,
        from_token: &str,
        limit: u16,
    ) -> Result<HistoryChunk, TransportError>;
}
