//! Accepted peer connections
//!
//! A [`Connection`] is the shared, write-side handle of one accepted
//! session. The read side is handed separately to the session's reader task,
//! which is the only owner responsible for closing the session.

use crate::error::{NetworkError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};

/// Write half of a connection, boxed so any byte sink can back it
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is active and can send/receive
    Connected,
    /// Close was requested; the reader task has not finished cleanup yet
    Closing,
    /// Connection is closed
    Closed,
}

/// Write handle for one accepted peer session
pub struct Connection {
    /// Identity used for registry membership and origin exclusion
    id: ConnectionId,
    /// Remote peer address (for logging)
    peer_addr: SocketAddr,
    /// Output sink; `None` once released
    writer: AsyncMutex<Option<BoxedWriter>>,
    /// Current connection state
    state: Mutex<ConnectionState>,
    /// Flipped to `true` when the connection is asked to close
    close_signal: watch::Sender<bool>,
    /// When this connection was accepted
    created_at: Instant,
    /// Total bytes written to this peer
    bytes_sent: AtomicU64,
    /// Total bytes read from this peer
    bytes_received: AtomicU64,
}

impl Connection {
    /// Wrap an arbitrary byte sink as a connection
    ///
    /// The matching read side must be driven by the caller.
    pub fn new<W>(peer_addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let (close_signal, _) = watch::channel(false);
        let writer: BoxedWriter = Box::pin(writer);

        Self {
            id: ConnectionId::next(),
            peer_addr,
            writer: AsyncMutex::new(Some(writer)),
            state: Mutex::new(ConnectionState::Connected),
            close_signal,
            created_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Split an accepted TCP stream into a connection and its read half
    pub fn accept(stream: TcpStream, peer_addr: SocketAddr) -> (Self, OwnedReadHalf) {
        let (read_half, write_half) = stream.into_split();
        (Self::new(peer_addr, write_half), read_half)
    }

    /// Write the whole payload to the peer and flush it
    ///
    /// No framing is added: the bytes go out exactly as given.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(self.closed_error());
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;

        writer
            .write_all(payload)
            .await
            .map_err(|e| self.send_error(e))?;
        writer.flush().await.map_err(|e| self.send_error(e))?;

        self.bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Ask the connection to close
    ///
    /// Wakes the reader task, which then runs its cleanup. Safe to call
    /// any number of times and from any thread.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closing;
            }
        }
        self.close_signal.send_replace(true);
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let mut rx = self.close_signal.subscribe();
        // The sender lives in `self`, so the channel cannot be dropped here.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Mark closed and drop the output sink
    ///
    /// If a send is in flight the sink is dropped when the last handle goes
    /// away instead.
    pub(crate) fn release(&self) {
        self.close();
        *self.state.lock() = ConnectionState::Closed;

        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    pub(crate) fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Connection identity
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Get total bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get total bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get connection age
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    fn closed_error(&self) -> crate::error::RelayError {
        NetworkError::ConnectionClosed {
            peer: self.peer_addr.to_string(),
        }
        .into()
    }

    fn send_error(&self, e: std::io::Error) -> crate::error::RelayError {
        NetworkError::SendFailed {
            peer: self.peer_addr.to_string(),
            reason: e.to_string(),
        }
        .into()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
