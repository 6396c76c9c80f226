use std::{fmt, sync::Arc};

use serde_json::Value;
use timeline_core::{
    AppendReport, Event, EventRecord, MemberProfile, RecordKey, RoomAggregate, RoomNotification,
    ScrollbackResult, SendOutcome, StateView, SubscriptionId, TimelineError,
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    channel::{ClientEvent, NotificationHub},
    config::ClientConfig,
    pending::PendingSend,
    transport::Transport,
};

/// Shared handle to one open room.
///
/// Every mutation goes through one lock per room, and no lock is held while a
/// transport call is awaited. Scrollback requests on the same room are queued
/// behind each other.
#[derive(Clone)]
pub struct Room {
    room_id: Arc<str>,
    aggregate: Arc<Mutex<RoomAggregate>>,
    paginating: Arc<Mutex<()>>,
    transport: Arc<dyn Transport>,
    hub: NotificationHub,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub(crate) fn new(
        mut aggregate: RoomAggregate,
        transport: Arc<dyn Transport>,
        hub: NotificationHub,
        config: Arc<ClientConfig>,
    ) -> Self {
        let forward = hub.clone();
        aggregate.subscribe(move |notification| {
            forward.emit(ClientEvent::Room(notification.clone()));
        });

        Self {
            room_id: Arc::from(aggregate.room_id()),
            aggregate: Arc::new(Mutex::new(aggregate)),
            paginating: Arc::new(Mutex::new(())),
            transport,
            hub,
            config,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Show `body` as a local echo now and send it in the background.
    pub async fn send_text(&self, body: impl Into<String>) -> Result<PendingSend, TimelineError> {
        let body = body.into();
        let transaction_id = Uuid::new_v4().to_string();
        let (key, draft) = {
            let mut room = self.aggregate.lock().await;
            let key = room.send_text_local(&transaction_id, body)?;
            let draft = room
                .pending_record(&transaction_id)
                .map(|record| record.event().clone())
                .ok_or_else(|| TimelineError::UnknownTransaction(transaction_id.clone()))?;
            (key, draft)
        };
        Ok(self.spawn_send(transaction_id, key, draft))
    }

    /// Send a failed message again under its original transaction ID.
    pub async fn resend(&self, transaction_id: &str) -> Result<PendingSend, TimelineError> {
        let (key, draft) = {
            let mut room = self.aggregate.lock().await;
            let draft = room.retry(transaction_id)?;
            let key = room
                .pending_record(transaction_id)
                .map(EventRecord::key)
                .ok_or_else(|| TimelineError::UnknownTransaction(transaction_id.to_owned()))?;
            (key, draft)
        };
        debug!(room_id = %self.room_id, transaction_id, "resending");
        Ok(self.spawn_send(transaction_id.to_owned(), key, draft))
    }

    /// Stop waiting for a send and show it as not sent.
    pub async fn mark_failed(&self, transaction_id: &str) -> Result<(), TimelineError> {
        self.aggregate.lock().await.mark_failed(transaction_id)
    }

    /// Fetch one page of older history.
    ///
    /// Once the start of the room has been reached this returns immediately
    /// without contacting the transport.
    pub async fn scrollback(&self, limit: Option<u16>) -> Result<ScrollbackResult, TimelineError> {
        let _queued = self.paginating.lock().await;

        let token = {
            let room = self.aggregate.lock().await;
            match room.cursor().token() {
                Some(token) => token.to_owned(),
                None => return Ok(ScrollbackResult::at_start()),
            }
        };

        let limit = self.config.scrollback_limit(limit);
        debug!(room_id = %self.room_id, limit, "fetching history");
        let chunk = self
            .transport
            .fetch_history(&self.room_id, &token, limit)
            .await?;

        let report = self
            .aggregate
            .lock()
            .await
            .prepend_historical(chunk.events, chunk.next_token);
        Ok(ScrollbackResult {
            added: report.added,
            exhausted: report.exhausted,
        })
    }

    /// Register a callback for this room's notifications only.
    pub async fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&RoomNotification) + Send + Sync + 'static,
    {
        self.aggregate.lock().await.subscribe(observer)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.aggregate.lock().await.unsubscribe(id)
    }

    /// Copy of the timeline records in display order.
    pub async fn timeline(&self) -> Vec<EventRecord> {
        self.aggregate.lock().await.timeline().iter().cloned().collect()
    }

    pub async fn current_state(&self) -> StateView {
        self.aggregate.lock().await.current_state()
    }

    pub async fn state_at(&self, position: usize) -> StateView {
        self.aggregate.lock().await.state_at(position)
    }

    pub async fn member(&self, user_id: &str) -> Option<MemberProfile> {
        self.aggregate.lock().await.member(user_id)
    }

    pub async fn sender_at(&self, index: usize) -> Option<MemberProfile> {
        self.aggregate.lock().await.sender_at(index)
    }

    pub async fn room_name(&self) -> Option<String> {
        self.aggregate.lock().await.room_name()
    }

    pub async fn is_history_exhausted(&self) -> bool {
        self.aggregate.lock().await.cursor().is_exhausted()
    }

    /// Run `read` against the room while holding its lock.
    pub async fn read<R>(&self, read: impl FnOnce(&RoomAggregate) -> R) -> R {
        read(&*self.aggregate.lock().await)
    }

    pub(crate) async fn apply_batch(&self, events: Vec<Event>) -> Result<AppendReport, TimelineError> {
        self.aggregate.lock().await.append_live(events)
    }

    fn spawn_send(&self, transaction_id: String, key: RecordKey, draft: Event) -> PendingSend {
        let room = self.clone();
        let txn = transaction_id.clone();
        let task = tokio::spawn(async move {
            room.drive_send(txn, draft.event_type, draft.content).await
        });
        PendingSend::new(transaction_id, key, task)
    }

    async fn drive_send(
        &self,
        transaction_id: String,
        event_type: String,
        content: Value,
    ) -> Result<String, TimelineError> {
        let outcome = SendOutcome::from(
            self.transport
                .send_event(&self.room_id, &event_type, content, &transaction_id)
                .await,
        );

        let ack = self.aggregate.lock().await.resolve(&transaction_id, &outcome);
        self.hub.emit(ClientEvent::SendAck(ack.clone()));

        // The ack carries the delivered ID when the echo beat a failure report.
        match (ack.event_id, outcome) {
            (Some(event_id), _) => {
                info!(room_id = %self.room_id, %transaction_id, %event_id, "send confirmed");
                Ok(event_id)
            }
            (None, SendOutcome::Failure { error }) => Err(TimelineError::SendFailed {
                transaction_id,
                error,
            }),
            (None, SendOutcome::Success { event_id }) => Ok(event_id),
        }
    }
}
