use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use timeline_core::{RoomNotification, SendAck, TransportError};

/// Events fanned out to every client subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientEvent {
    /// A room's timeline changed.
    Room(RoomNotification),
    /// A send finished, successfully or not.
    SendAck(SendAck),
    /// Polling the live stream failed.
    SyncFailed {
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl ClientEvent {
    pub fn sync_failed(error: &TransportError) -> Self {
        Self::SyncFailed {
            code: error.code.clone(),
            message: error.message.clone(),
            recoverable: error.is_recoverable(),
        }
    }
}

/// Broadcast event stream type used by subscribers.
pub type EventStream = broadcast::Receiver<ClientEvent>;

/// Broadcast hub shared by the client and its rooms.
#[derive(Clone, Debug)]
pub struct NotificationHub {
    event_tx: broadcast::Sender<ClientEvent>,
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted client events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use timeline_core::TransportErrorCategory;

    use super::*;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let hub = NotificationHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(ClientEvent::Room(RoomNotification::TimelinePrepended {
            room_id: "!room:example.org".into(),
            count: 3,
        }));

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let hub = NotificationHub::new(0);
        hub.emit(ClientEvent::sync_failed(&TransportError::new(
            TransportErrorCategory::Network,
            "timeout",
            "no response",
        )));
    }

    #[test]
    fn sync_failure_carries_recoverability() {
        let event = ClientEvent::sync_failed(&TransportError::new(
            TransportErrorCategory::Auth,
            "unknown_token",
            "logged out",
        ));
        assert_eq!(
            event,
            ClientEvent::SyncFailed {
                code: "unknown_token".into(),
                message: "logged out".into(),
                recoverable: false,
            }
        );
    }
}
