//! Common test helpers and utilities
//!
//! Shared fixtures for the relay integration tests.

#![allow(dead_code)]

use chat_relay::{ClientEvent, Event, Relay, RelayBuilder, RelayClient};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on a random localhost port
pub async fn start_relay() -> (Relay, SocketAddr) {
    let relay = RelayBuilder::new()
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_write_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let addr = relay.start().await.unwrap();
    (relay, addr)
}

/// Connect `count` clients and wait until the relay has registered all of them
pub async fn connect_clients(relay: &Relay, addr: SocketAddr, count: usize) -> Vec<RelayClient> {
    let before = relay.connection_count();
    let mut clients = Vec::with_capacity(count);
    for _ in 0..count {
        clients.push(RelayClient::connect(addr).await.unwrap());
    }
    wait_for_connections(relay, before + count).await;
    clients
}

/// Wait until the relay reports exactly `expected` registered connections
pub async fn wait_for_connections(relay: &Relay, expected: usize) {
    timeout(WAIT, async {
        while relay.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {} connections, relay has {}",
            expected,
            relay.connection_count()
        )
    });
}

/// Next chunk of text a client receives
pub async fn expect_text(client: &RelayClient) -> String {
    match timeout(WAIT, client.next_event()).await {
        Ok(Some(ClientEvent::Received { content })) => String::from_utf8(content).unwrap(),
        other => panic!("expected a message, got {:?}", other),
    }
}

/// Assert that a client receives nothing for `window`
pub async fn expect_silence(client: &RelayClient, window: Duration) {
    if let Ok(event) = timeout(window, client.next_event()).await {
        panic!("expected no traffic, got {:?}", event);
    }
}

/// Counts relay events by kind
#[derive(Default)]
pub struct EventCounter {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub accepted: AtomicUsize,
    pub received: AtomicUsize,
    pub closed: AtomicUsize,
}

impl EventCounter {
    /// Subscribe a new counter to the relay's events
    pub fn attach(relay: &Relay) -> Arc<Self> {
        let counter = Arc::new(Self::default());
        let handle = Arc::clone(&counter);
        relay.on_event(move |event| {
            let slot = match event {
                Event::RelayStarted { .. } => &handle.started,
                Event::RelayStopped => &handle.stopped,
                Event::ConnectionAccepted { .. } => &handle.accepted,
                Event::MessageReceived { .. } => &handle.received,
                Event::ConnectionClosed { .. } => &handle.closed,
                Event::SendFailed { .. } => return,
            };
            slot.fetch_add(1, Ordering::SeqCst);
        });
        counter
    }

    pub fn get(slot: &AtomicUsize) -> usize {
        slot.load(Ordering::SeqCst)
    }
}
