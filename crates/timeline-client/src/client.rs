use std::{collections::HashMap, fmt, sync::Arc};

use timeline_core::{RoomAggregate, TimelineError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    channel::{ClientEvent, EventStream, NotificationHub},
    config::ClientConfig,
    room::Room,
    transport::Transport,
};

/// Totals for one stream poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Batches applied to open rooms.
    pub batches: usize,
    /// Records inserted across all rooms.
    pub inserted: usize,
    /// Local echoes settled by their stream copy.
    pub reconciled: usize,
    /// Events dropped as duplicates or malformed.
    pub skipped: usize,
    /// Batches dropped because their room is not open.
    pub unknown_rooms: usize,
}

/// Entry point that owns the open rooms and drives the live stream.
pub struct Client {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    hub: NotificationHub,
    rooms: RwLock<HashMap<String, Room>>,
    syncing: Mutex<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("user_id", &self.config.user_id)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let hub = NotificationHub::new(config.notification_buffer);
        Self {
            config: Arc::new(config),
            transport,
            hub,
            rooms: RwLock::new(HashMap::new()),
            syncing: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// Subscribe to notifications from every room plus send and sync events.
    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Open a room from its initial snapshot, or return it if already open.
    ///
    /// Stream polling waits until the room is registered, so no batch for it
    /// is dropped while the snapshot is in flight.
    pub async fn open_room(&self, room_id: &str) -> Result<Room, TimelineError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }

        let _in_order = self.syncing.lock().await;
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }
        let mut snapshot = self.transport.fetch_initial_snapshot(room_id).await?;
        if snapshot.room_id != room_id {
            debug!(
                requested = room_id,
                reported = %snapshot.room_id,
                "snapshot room id differs; using requested id"
            );
            snapshot.room_id = room_id.to_owned();
        }
        let (aggregate, report) = RoomAggregate::from_snapshot(self.config.user_id.clone(), snapshot);
        if !report.skipped.is_empty() {
            warn!(room_id, skipped = report.skipped.len(), "snapshot had unusable events");
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| {
                Room::new(
                    aggregate,
                    Arc::clone(&self.transport),
                    self.hub.clone(),
                    Arc::clone(&self.config),
                )
            })
            .clone();
        Ok(room)
    }

    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Poll the live stream once and apply every batch in arrival order.
    ///
    /// Concurrent calls are queued so batches are never applied out of order.
    pub async fn sync_once(&self) -> Result<SyncSummary, TimelineError> {
        let _in_order = self.syncing.lock().await;

        let batches = match self.transport.poll_stream().await {
            Ok(batches) => batches,
            Err(err) => {
                warn!(%err, "stream poll failed");
                self.hub.emit(ClientEvent::sync_failed(&err));
                return Err(err.into());
            }
        };

        let mut summary = SyncSummary::default();
        for batch in batches {
            if batch.events.is_empty() {
                debug!(room_id = %batch.room_id, "skipping empty batch");
                continue;
            }
            let Some(room) = self.room(&batch.room_id).await else {
                warn!(room_id = %batch.room_id, "batch for a room that is not open");
                summary.unknown_rooms += 1;
                continue;
            };
            let report = room.apply_batch(batch.events).await?;
            summary.batches += 1;
            summary.inserted += report.inserted;
            summary.reconciled += report.reconciled.len();
            summary.skipped += report.skipped.len();
        }

        if summary.batches > 0 {
            info!(
                batches = summary.batches,
                inserted = summary.inserted,
                skipped = summary.skipped,
                "applied stream batches"
            );
        }
        Ok(summary)
    }
}
