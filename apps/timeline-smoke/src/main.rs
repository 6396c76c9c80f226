mod logging;

use std::sync::Arc;

use serde_json::json;
use timeline_client::{Client, ClientConfig, ClientEvent, LoopbackTransport};
use timeline_core::{Event, EventStatus, ROOM_NAME_EVENT_TYPE, TimelineError};
use tracing::{error, info};

const ROOM_ID: &str = "!smoke:loopback";
const PEER_ID: &str = "@peer:loopback";
const HISTORY_MESSAGES: usize = 12;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: TIMELINE_USER_ID (for example @me:loopback)");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(%err, "smoke run failed");
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: ClientConfig) -> Result<(), TimelineError> {
    let user_id = config.user_id.clone();
    let transport = Arc::new(LoopbackTransport::new(user_id.clone()).with_snapshot_limit(5));
    transport
        .create_room(
            ROOM_ID,
            vec![
                Event::membership(ROOM_ID, user_id.clone(), "join", Some("Me")),
                Event::membership(ROOM_ID, PEER_ID, "join", Some("Peer")),
                Event::new(ROOM_NAME_EVENT_TYPE, ROOM_ID, PEER_ID, json!({ "name": "Smoke" }))
                    .with_state_key(""),
            ],
        )
        .await?;
    for n in 0..HISTORY_MESSAGES {
        transport
            .inject(ROOM_ID, Event::text_message(ROOM_ID, PEER_ID, format!("history {n}")))
            .await?;
    }
    transport.clear_stream().await;

    let client = Client::new(config, transport.clone());
    let mut events = client.subscribe();
    let room = client.open_room(ROOM_ID).await?;

    let pending = room.send_text("hello from timeline-smoke").await?;
    let event_id = pending.wait().await?;
    info!(%event_id, "local send confirmed");

    transport
        .inject(ROOM_ID, Event::text_message(ROOM_ID, PEER_ID, "welcome back"))
        .await?;
    let summary = client.sync_once().await?;
    info!(?summary, "stream applied");

    let mut pages = 0;
    loop {
        let page = room.scrollback(None).await?;
        pages += 1;
        if page.exhausted {
            break;
        }
    }
    info!(pages, "history loaded");

    let mut notifications = 0usize;
    let mut acks = 0usize;
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::Room(_) => notifications += 1,
            ClientEvent::SendAck(_) => acks += 1,
            ClientEvent::SyncFailed { .. } => {}
        }
    }

    let records = room.timeline().await;
    println!(
        "Room {} ({}): {} records, {} notifications, {} send acks",
        ROOM_ID,
        room.room_name().await.unwrap_or_default(),
        records.len(),
        notifications,
        acks
    );
    for (index, record) in records.iter().enumerate() {
        let Some(body) = record.event().body() else {
            continue;
        };
        let sender = room
            .sender_at(index)
            .await
            .map(|member| member.name().to_owned())
            .unwrap_or_else(|| record.sender().to_owned());
        let marker = match record.status() {
            EventStatus::Sent => ' ',
            EventStatus::Sending => '~',
            EventStatus::NotSent => '!',
        };
        println!("{marker} {sender}: {body}");
    }
    Ok(())
}
