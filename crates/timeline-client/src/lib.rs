//! Async room drivers over the timeline engine.
//!
//! A [`Client`] opens rooms from their initial snapshot, feeds live stream
//! batches into them in arrival order, and fans every change out on one
//! broadcast channel. Each [`Room`] serializes its own mutations and runs
//! sends and scrollback against a [`Transport`].

mod channel;
mod client;
mod config;
mod loopback;
mod pending;
mod room;
mod transport;

pub use channel::{ClientEvent, EventStream, NotificationHub};
pub use client::{Client, SyncSummary};
pub use config::{ClientConfig, ConfigError};
pub use loopback::LoopbackTransport;
pub use pending::PendingSend;
pub use room::Room;
pub use transport::Transport;
