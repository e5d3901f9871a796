//! Broadcast fan-out
//!
//! Delivers one message to every registered connection except its origin.
//! Each recipient is written to in its own task with a deadline, so a slow
//! or broken peer only costs its own delivery.

use crate::api::events::{Event, EventHandlers};
use crate::error::NetworkError;
use crate::network::connection::{Connection, ConnectionId};
use crate::network::registry::Registry;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Read from an accepted peer connection
    Peer(ConnectionId),
    /// Originated by the local front end
    Local,
}

/// An immutable payload plus the identity of its origin
///
/// The payload is exactly what one read delivered; it has no further
/// structure.
#[derive(Debug, Clone)]
pub struct Message {
    origin: Origin,
    content: Arc<[u8]>,
}

impl Message {
    /// A message read from a peer connection
    pub fn from_peer(id: ConnectionId, content: &[u8]) -> Self {
        Self {
            origin: Origin::Peer(id),
            content: Arc::from(content),
        }
    }

    /// A message originated locally
    pub fn local(content: &[u8]) -> Self {
        Self {
            origin: Origin::Local,
            content: Arc::from(content),
        }
    }

    /// Origin of the message
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Raw payload
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    fn is_from(&self, id: ConnectionId) -> bool {
        self.origin == Origin::Peer(id)
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients the payload was fully written to
    pub delivered: usize,
    /// Recipients whose write failed or timed out
    pub failed: usize,
}

impl FanoutReport {
    /// Number of recipients attempted
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Writes messages to every registered connection except the origin
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    write_timeout: Duration,
    events: EventHandlers,
}

impl Broadcaster {
    /// Create a broadcaster over a registry
    pub fn new(registry: Arc<Registry>, write_timeout: Duration, events: EventHandlers) -> Self {
        Self {
            registry,
            write_timeout,
            events,
        }
    }

    /// Deliver `message` to every registered connection except its origin
    ///
    /// Write failures are logged and counted, never returned, and never
    /// remove the failed recipient from the registry. Waits until every
    /// attempt has finished or hit the write timeout.
    ///
    /// A write cut off by the timeout may already have sent part of the
    /// payload. Since there is no framing, that recipient then sees the
    /// truncated message run straight into the next one it receives.
    pub async fn fanout(&self, message: &Message) -> FanoutReport {
        let recipients: Vec<Arc<Connection>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| !message.is_from(conn.id()))
            .collect();

        let mut report = FanoutReport::default();
        if recipients.is_empty() {
            return report;
        }

        let mut writes = JoinSet::new();
        for conn in recipients {
            let content = Arc::clone(&message.content);
            let write_timeout = self.write_timeout;

            writes.spawn(async move {
                let result = match tokio::time::timeout(write_timeout, conn.send(&content)).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::WriteTimeout {
                        peer: conn.peer_addr().to_string(),
                        timeout_ms: write_timeout.as_millis() as u64,
                    }
                    .into()),
                };
                (conn, result)
            });
        }

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((conn, Err(error))) => {
                    report.failed += 1;
                    warn!(
                        peer = %conn.peer_addr(),
                        connection_id = %conn.id(),
                        %error,
                        "send to peer failed"
                    );
                    self.events.dispatch(Event::SendFailed {
                        connection_id: conn.id(),
                        peer_addr: conn.peer_addr(),
                        reason: error.to_string(),
                    });
                },
                Err(join_error) => {
                    report.failed += 1;
                    warn!(error = %join_error, "send task did not complete");
                },
            }
        }

        debug!(
            origin = ?message.origin(),
            delivered = report.delivered,
            failed = report.failed,
            "fan-out finished"
        );

        report
    }

    /// The registry this broadcaster reads recipients from
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};

    /// Sink that fails every write, like a peer whose transport was reset
    struct ResetWriter;

    impl AsyncWrite for ResetWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink that never accepts a byte
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn healthy(registry: &Registry, port: u16) -> (DuplexStream, Arc<Connection>) {
        let (peer, local) = tokio::io::duplex(1024);
        let conn = Arc::new(Connection::new(addr(port), local));
        registry.add(&conn);
        (peer, conn)
    }

    fn broadcaster(registry: &Arc<Registry>, events: EventHandlers) -> Broadcaster {
        Broadcaster::new(registry.clone(), Duration::from_millis(200), events)
    }

    async fn read_some<R: AsyncRead + Unpin>(peer: &mut R) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("recipient should receive data")
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_fanout_excludes_origin() {
        let registry = Arc::new(Registry::new());
        let (mut pa, a) = healthy(&registry, 1);
        let (mut pb, _b) = healthy(&registry, 2);
        let (mut pc, _c) = healthy(&registry, 3);

        let report = broadcaster(&registry, EventHandlers::new())
            .fanout(&Message::from_peer(a.id(), b"hi"))
            .await;

        assert_eq!(report, FanoutReport { delivered: 2, failed: 0 });
        assert_eq!(read_some(&mut pb).await, b"hi");
        assert_eq!(read_some(&mut pc).await, b"hi");

        let mut buf = [0u8; 8];
        let nothing = tokio::time::timeout(Duration::from_millis(50), pa.read(&mut buf)).await;
        assert!(nothing.is_err(), "origin must not receive its own message");
    }

    #[tokio::test]
    async fn test_local_message_reaches_everyone() {
        let registry = Arc::new(Registry::new());
        let (mut pa, _a) = healthy(&registry, 1);
        let (mut pb, _b) = healthy(&registry, 2);

        let report = broadcaster(&registry, EventHandlers::new())
            .fanout(&Message::local(b"from the console"))
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(read_some(&mut pa).await, b"from the console");
        assert_eq!(read_some(&mut pb).await, b"from the console");
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let registry = Arc::new(Registry::new());
        let (_pa, a) = healthy(&registry, 1);
        let broken = Arc::new(Connection::new(addr(2), ResetWriter));
        registry.add(&broken);
        let (mut pc, _c) = healthy(&registry, 3);

        let failures = Arc::new(AtomicUsize::new(0));
        let events = EventHandlers::new();
        let counter = failures.clone();
        events.subscribe(move |event| {
            if matches!(event, Event::SendFailed { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let report = broadcaster(&registry, events)
            .fanout(&Message::from_peer(a.id(), b"still here"))
            .await;

        assert_eq!(report, FanoutReport { delivered: 1, failed: 1 });
        assert_eq!(read_some(&mut pc).await, b"still here");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        // Removal is left to the failed connection's own reader task
        assert!(registry.contains(broken.id()));
    }

    #[tokio::test]
    async fn test_stalled_recipient_is_dropped_after_timeout() {
        let registry = Arc::new(Registry::new());
        let stalled = Arc::new(Connection::new(addr(1), StalledWriter));
        registry.add(&stalled);
        let (mut pb, _b) = healthy(&registry, 2);

        let started = std::time::Instant::now();
        let report = broadcaster(&registry, EventHandlers::new())
            .fanout(&Message::local(b"tick"))
            .await;

        assert_eq!(report, FanoutReport { delivered: 1, failed: 1 });
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(read_some(&mut pb).await, b"tick");
    }

    #[tokio::test]
    async fn test_timed_out_write_leaves_partial_message() {
        let registry = Arc::new(Registry::new());
        // Room for four bytes until the peer starts reading
        let (mut peer, local) = tokio::io::duplex(4);
        let slow = Arc::new(Connection::new(addr(1), local));
        registry.add(&slow);
        let broadcaster = broadcaster(&registry, EventHandlers::new());

        let report = broadcaster.fanout(&Message::local(b"abcdefghij")).await;
        assert_eq!(report, FanoutReport { delivered: 0, failed: 1 });

        let drain = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 16];
            while received.len() < 7 {
                let n = peer.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let report = broadcaster.fanout(&Message::local(b"XYZ")).await;
        assert_eq!(report.delivered, 1);

        let received = tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"abcdXYZ");
    }

    #[tokio::test]
    async fn test_fanout_with_no_recipients() {
        let registry = Arc::new(Registry::new());
        let (_pa, a) = healthy(&registry, 1);

        let report = broadcaster(&registry, EventHandlers::new())
            .fanout(&Message::from_peer(a.id(), b"alone"))
            .await;

        assert_eq!(report.attempted(), 0);
    }

    #[test]
    fn test_message_text_is_lossy() {
        let message = Message::local(&[b'o', b'k', 0xff]);
        assert_eq!(message.text(), "ok\u{fffd}");
        assert_eq!(message.origin(), Origin::Local);
    }
}
