use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use timeline_client::{Client, ClientConfig, ClientEvent, Transport};
use timeline_core::{
    Event, EventStatus, HistoryChunk, InitialSnapshot, RoomBatch, SendState, TimelineError,
    TransportError, TransportErrorCategory,
};
use tokio::{
    sync::{Mutex, Notify, oneshot},
    time::timeout,
};

const ROOM: &str = "!room:example.org";
const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

type SendGate = oneshot::Receiver<Result<String, TransportError>>;

/// Transport whose answers are scripted by the test.
///
/// Each `send_event` call waits on the next gate, so the test decides when the
/// confirmation lands relative to stream batches.
#[derive(Default)]
struct ScriptedTransport {
    snapshot: Mutex<Option<InitialSnapshot>>,
    stream: Mutex<VecDeque<Vec<RoomBatch>>>,
    history: Mutex<VecDeque<HistoryChunk>>,
    gates: Mutex<VecDeque<SendGate>>,
    snapshot_gate: Mutex<Option<oneshot::Receiver<()>>>,
    snapshot_requested: Notify,
    sent: Mutex<Vec<(String, Value)>>,
    history_calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(snapshot: InitialSnapshot) -> Arc<Self> {
        let transport = Self::default();
        *transport.snapshot.try_lock().expect("fresh mutex") = Some(snapshot);
        Arc::new(transport)
    }

    async fn gate(&self) -> oneshot::Sender<Result<String, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().await.push_back(rx);
        tx
    }

    async fn push_stream(&self, events: Vec<Event>) {
        self.stream.lock().await.push_back(vec![RoomBatch {
            room_id: ROOM.into(),
            events,
        }]);
    }

    async fn push_history(&self, events: Vec<Event>, next_token: Option<&str>) {
        self.history.lock().await.push_back(HistoryChunk {
            events,
            next_token: next_token.map(ToOwned::to_owned),
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch_initial_snapshot(
        &self,
        _room_id: &str,
    ) -> Result<InitialSnapshot, TransportError> {
        self.snapshot_requested.notify_one();
        let gate = self.snapshot_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.snapshot.lock().await.clone().unwrap_or_default())
    }

    async fn poll_stream(&self) -> Result<Vec<RoomBatch>, TransportError> {
        self.stream.lock().await.pop_front().ok_or_else(|| {
            TransportError::new(TransportErrorCategory::Network, "timeout", "nothing queued")
        })
    }

    async fn send_event(
        &self,
        _room_id: &str,
        _event_type: &str,
        content: Value,
        transaction_id: &str,
    ) -> Result<String, TransportError> {
        self.sent
            .lock()
            .await
            .push((transaction_id.to_owned(), content));
        let gate = self.gates.lock().await.pop_front();
        match gate {
            Some(gate) => gate.await.unwrap_or_else(|_| {
                Err(TransportError::new(
                    TransportErrorCategory::Internal,
                    "gate_dropped",
                    "test dropped the send gate",
                ))
            }),
            None => Err(TransportError::new(
                TransportErrorCategory::Internal,
                "no_gate",
                "send was not scripted",
            )),
        }
    }

    async fn fetch_history(
        &self,
        _room_id: &str,
        _from_token: &str,
        _limit: u16,
    ) -> Result<HistoryChunk, TransportError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.history.lock().await.pop_front().unwrap_or_default())
    }
}

fn snapshot() -> InitialSnapshot {
    InitialSnapshot {
        room_id: ROOM.into(),
        state: vec![
            Event::membership(ROOM, ALICE, "join", Some("Alice")).with_event_id("$ma"),
            Event::membership(ROOM, BOB, "join", Some("Bob")).with_event_id("$mb"),
        ],
        timeline: vec![Event::text_message(ROOM, BOB, "hello").with_event_id("$hello")],
        pagination_token: Some("t0".into()),
    }
}

async fn open(transport: &Arc<ScriptedTransport>) -> (Client, timeline_client::Room) {
    let client = Client::new(ClientConfig::new(ALICE), transport.clone());
    let room = client.open_room(ROOM).await.expect("room opens");
    (client, room)
}

fn echo(transaction_id: &str, event_id: &str, body: &str) -> Event {
    Event::text_message(ROOM, ALICE, body)
        .with_event_id(event_id)
        .with_transaction_id(transaction_id)
}

async fn wait_for_sent(transport: &ScriptedTransport, count: usize) {
    timeout(Duration::from_secs(2), async {
        while transport.sent.lock().await.len() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("send should reach the transport");
}

#[tokio::test]
async fn local_echo_is_visible_before_the_send_returns() {
    let transport = ScriptedTransport::new(snapshot());
    let (_, room) = open(&transport).await;
    let _gate = transport.gate().await;

    let pending = room.send_text("I am a fish").await.expect("local echo");
    let records = room.timeline().await;

    assert_eq!(records.len(), 2);
    let local = &records[1];
    assert_eq!(local.key(), pending.key());
    assert_eq!(local.status(), EventStatus::Sending);
    assert_eq!(local.event_id(), None);
    assert_eq!(local.transaction_id(), Some(pending.transaction_id()));
    assert_eq!(
        room.sender_at(1).await.map(|member| member.name().to_owned()),
        Some("Alice".into())
    );
}

#[tokio::test]
async fn confirmation_before_echo_converges() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let gate = transport.gate().await;

    let pending = room.send_text("I am a fish").await.expect("local echo");
    let txn = pending.transaction_id().to_owned();
    gate.send(Ok("$foo:bar".into())).expect("send task waiting");
    assert_eq!(pending.wait().await, Ok("$foo:bar".to_owned()));

    transport
        .push_stream(vec![echo(&txn, "$foo:bar", "I am a fish")])
        .await;
    let summary = client.sync_once().await.expect("sync");

    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.skipped, 1);
    let records = room.timeline().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].event_id(), Some("$foo:bar"));
    assert_eq!(records[1].status(), EventStatus::Sent);
    assert_eq!(room.read(|room| room.echo_state(&txn)).await, None);
}

#[tokio::test]
async fn echo_before_confirmation_converges() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let gate = transport.gate().await;

    let pending = room.send_text("I am a fish").await.expect("local echo");
    let txn = pending.transaction_id().to_owned();
    let key = pending.key();
    wait_for_sent(&transport, 1).await;

    transport
        .push_stream(vec![echo(&txn, "$foo:bar", "I am a fish")])
        .await;
    let summary = client.sync_once().await.expect("sync");
    assert_eq!(summary.reconciled, 1);
    assert_eq!(
        room.read(|room| room.echo_state(&txn)).await,
        Some(SendState::EchoReceived)
    );

    gate.send(Ok("$foo:bar".into())).expect("send task waiting");
    assert_eq!(pending.wait().await, Ok("$foo:bar".to_owned()));

    let records = room.timeline().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].key(), key);
    assert_eq!(records[1].event_id(), Some("$foo:bar"));
    assert_eq!(records[1].status(), EventStatus::Sent);
    assert_eq!(room.read(|room| room.echo_state(&txn)).await, None);
}

#[tokio::test]
async fn failed_send_is_kept_and_can_be_resent() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let mut events = client.subscribe();
    let gate = transport.gate().await;

    let pending = room.send_text("flaky").await.expect("local echo");
    let txn = pending.transaction_id().to_owned();
    gate.send(Err(TransportError::new(
        TransportErrorCategory::Network,
        "send_failed",
        "connection reset",
    )))
    .expect("send task waiting");

    let err = pending.wait().await.expect_err("send fails");
    assert!(matches!(err, TimelineError::SendFailed { ref transaction_id, .. } if *transaction_id == txn));
    let records = room.timeline().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status(), EventStatus::NotSent);
    assert_eq!(room.read(|room| room.timeline().delivered_len()).await, 1);

    let mut saw_failed_ack = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let ClientEvent::SendAck(ack) = event {
            assert_eq!(ack.transaction_id, txn);
            assert_eq!(ack.error_code.as_deref(), Some("send_failed"));
            saw_failed_ack = true;
            break;
        }
    }
    assert!(saw_failed_ack);

    let gate = transport.gate().await;
    let retry = room.resend(&txn).await.expect("failed send can be resent");
    assert_eq!(retry.transaction_id(), txn);
    assert_eq!(room.timeline().await[1].status(), EventStatus::Sending);
    gate.send(Ok("$flaky".into())).expect("send task waiting");
    assert_eq!(retry.wait().await, Ok("$flaky".to_owned()));

    let records = room.timeline().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].event_id(), Some("$flaky"));
    assert_eq!(records[1].status(), EventStatus::Sent);

    let sent = transport.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(sent_txn, content)| {
        *sent_txn == txn && content == &json!({ "msgtype": "m.text", "body": "flaky" })
    }));
}

#[tokio::test]
async fn identical_messages_are_reconciled_by_transaction() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let first_gate = transport.gate().await;
    let second_gate = transport.gate().await;

    let first = room.send_text("same").await.expect("local echo");
    wait_for_sent(&transport, 1).await;
    let second = room.send_text("same").await.expect("local echo");
    wait_for_sent(&transport, 2).await;

    transport
        .push_stream(vec![echo(second.transaction_id(), "$2", "same")])
        .await;
    client.sync_once().await.expect("sync");
    first_gate.send(Ok("$1".into())).expect("send task waiting");
    second_gate.send(Ok("$2".into())).expect("send task waiting");
    first.wait().await.expect("first send");
    second.wait().await.expect("second send");

    let ids: Vec<_> = room
        .timeline()
        .await
        .iter()
        .map(|record| record.event_id().map(ToOwned::to_owned))
        .collect();
    assert_eq!(
        ids,
        vec![Some("$hello".into()), Some("$2".into()), Some("$1".into())]
    );
}

#[tokio::test]
async fn live_events_never_land_behind_pending_sends() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let _gate = transport.gate().await;

    room.send_text("waiting").await.expect("local echo");
    transport
        .push_stream(vec![
            Event::text_message(ROOM, BOB, "one").with_event_id("$1"),
            Event::text_message(ROOM, BOB, "one").with_event_id("$1"),
            Event::text_message(ROOM, BOB, "two").with_event_id("$2"),
        ])
        .await;
    let summary = client.sync_once().await.expect("sync");

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.skipped, 1);
    let statuses: Vec<_> = room.timeline().await.iter().map(|r| r.status()).collect();
    assert_eq!(
        statuses,
        vec![
            EventStatus::Sent,
            EventStatus::Sent,
            EventStatus::Sent,
            EventStatus::Sending,
        ]
    );
}

#[tokio::test]
async fn terminal_pagination_never_calls_the_transport_again() {
    let transport = ScriptedTransport::new(snapshot());
    let (_, room) = open(&transport).await;
    transport
        .push_history(
            vec![
                Event::text_message(ROOM, BOB, "I am new").with_event_id("$new"),
                Event::text_message(ROOM, BOB, "I am old").with_event_id("$old"),
            ],
            None,
        )
        .await;

    let result = room.scrollback(None).await.expect("page");
    assert_eq!(result.added, 2);
    assert!(result.exhausted);

    for _ in 0..3 {
        let result = room.scrollback(Some(10)).await.expect("no-op page");
        assert_eq!(result.added, 0);
        assert!(result.exhausted);
    }
    assert_eq!(transport.history_calls.load(Ordering::SeqCst), 1);

    let bodies: Vec<_> = room
        .timeline()
        .await
        .iter()
        .filter_map(|record| record.event().body().map(ToOwned::to_owned))
        .collect();
    assert_eq!(bodies, vec!["I am old", "I am new", "hello"]);
}

#[tokio::test]
async fn empty_history_page_exhausts_even_with_a_token() {
    let transport = ScriptedTransport::new(snapshot());
    let (_, room) = open(&transport).await;
    transport.push_history(Vec::new(), Some("t1")).await;

    let result = room.scrollback(None).await.expect("page");
    assert_eq!(result.added, 0);
    assert!(result.exhausted);
    assert!(room.is_history_exhausted().await);
}

#[tokio::test]
async fn historical_sender_keeps_old_display_name() {
    let transport = ScriptedTransport::new(snapshot());
    let (_, room) = open(&transport).await;
    transport
        .push_history(
            vec![
                Event::membership(ROOM, ALICE, "join", Some("Alice"))
                    .with_event_id("$rename")
                    .with_prev_content(json!({ "membership": "join", "displayname": "Old Alice" })),
                Event::text_message(ROOM, ALICE, "I am old").with_event_id("$said"),
                Event::membership(ROOM, ALICE, "join", Some("Old Alice"))
                    .with_event_id("$join")
                    .with_prev_content(json!({})),
            ],
            Some("t1"),
        )
        .await;

    room.scrollback(None).await.expect("page");
    let said = room
        .read(|room| {
            room.timeline()
                .iter()
                .position(|record| record.event_id() == Some("$said"))
        })
        .await
        .expect("history spliced");

    assert_eq!(
        room.sender_at(said).await.map(|member| member.name().to_owned()),
        Some("Old Alice".into())
    );
    assert_eq!(
        room.member(ALICE).await.map(|member| member.name().to_owned()),
        Some("Alice".into())
    );
    assert_eq!(
        room.state_at(0)
            .await
            .member(ALICE)
            .map(|member| member.name().to_owned()),
        Some("Old Alice".into())
    );
}

#[tokio::test]
async fn stream_failure_is_broadcast() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, _) = open(&transport).await;
    let mut events = client.subscribe();

    let err = client.sync_once().await.expect_err("nothing queued");
    assert!(matches!(err, TimelineError::Transport(_)));

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event receive");
    assert_eq!(
        event,
        ClientEvent::SyncFailed {
            code: "timeout".into(),
            message: "nothing queued".into(),
            recoverable: true,
        }
    );
}

#[tokio::test]
async fn stream_batch_during_room_open_is_applied() {
    let transport = ScriptedTransport::new(snapshot());
    let (release, gate) = oneshot::channel();
    *transport.snapshot_gate.lock().await = Some(gate);
    transport
        .push_stream(vec![Event::text_message(ROOM, BOB, "late").with_event_id("$late")])
        .await;

    let client = Arc::new(Client::new(ClientConfig::new(ALICE), transport.clone()));
    let opening = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.open_room(ROOM).await }
    });
    transport.snapshot_requested.notified().await;

    let syncing = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.sync_once().await }
    });
    release.send(()).expect("snapshot fetch waiting");

    let room = opening.await.expect("open task").expect("room opens");
    let summary = syncing.await.expect("sync task").expect("sync");
    assert_eq!(summary.unknown_rooms, 0);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.inserted, 1);

    let ids: Vec<_> = room
        .timeline()
        .await
        .iter()
        .map(|record| record.event_id().map(ToOwned::to_owned))
        .collect();
    assert_eq!(ids, vec![Some("$hello".into()), Some("$late".into())]);
}

#[tokio::test]
async fn failure_after_echo_resolves_to_the_delivered_event() {
    let transport = ScriptedTransport::new(snapshot());
    let (client, room) = open(&transport).await;
    let gate = transport.gate().await;

    let pending = room.send_text("made it").await.expect("local echo");
    let txn = pending.transaction_id().to_owned();
    wait_for_sent(&transport, 1).await;
    transport
        .push_stream(vec![echo(&txn, "$made", "made it")])
        .await;
    client.sync_once().await.expect("sync");

    gate.send(Err(TransportError::new(
        TransportErrorCategory::Network,
        "send_failed",
        "response lost",
    )))
    .expect("send task waiting");

    assert_eq!(pending.wait().await, Ok("$made".to_owned()));
    let records = room.timeline().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status(), EventStatus::Sent);
    assert_eq!(room.read(|room| room.echo_state(&txn)).await, None);
}
