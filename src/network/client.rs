//! Relay client
//!
//! The peer side of the relay: connect, send text, and receive whatever
//! the relay forwards. Like the relay itself it adds no framing, so each
//! received chunk is exactly what one read returned.

use crate::error::{NetworkError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Size of the client's read buffer
const CLIENT_READ_BUFFER_SIZE: usize = 4096;

/// Something that happened on the client's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Bytes forwarded by the relay (one read)
    Received {
        /// Raw payload
        content: Vec<u8>,
    },
    /// The connection ended; no further events follow
    Disconnected,
}

impl ClientEvent {
    /// Text of a received chunk, decoded lossily
    pub fn text(&self) -> Option<String> {
        match self {
            ClientEvent::Received { content } => Some(String::from_utf8_lossy(content).into_owned()),
            ClientEvent::Disconnected => None,
        }
    }
}

/// A connection to a relay
pub struct RelayClient {
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    events: Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    connected: watch::Receiver<bool>,
    close_signal: watch::Sender<bool>,
    receive_task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to a relay and start receiving
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::ConnectionFailed` if the TCP connection
    /// cannot be established.
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        let stream =
            TcpStream::connect(server_addr)
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    address: server_addr.to_string(),
                    reason: e.to_string(),
                })?;

        let local_addr = stream
            .local_addr()
            .map_err(|e| NetworkError::ConnectionFailed {
                address: server_addr.to_string(),
                reason: format!("Failed to get local address: {}", e),
            })?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(true);
        let (close_signal, close_rx) = watch::channel(false);

        let receive_task = tokio::spawn(receive_loop(read_half, event_tx, connected_tx, close_rx));

        info!(server = %server_addr, local = %local_addr, "connected to relay");

        Ok(Self {
            server_addr,
            local_addr,
            writer: Mutex::new(Some(write_half)),
            events: Mutex::new(event_rx),
            connected: connected_rx,
            close_signal,
            receive_task,
        })
    }

    /// Send text to the relay
    ///
    /// The bytes are written as-is, without a delimiter.
    ///
    /// # Errors
    ///
    /// - `NetworkError::EmptyMessage` if `text` is empty or whitespace;
    ///   nothing is written
    /// - `NetworkError::NotConnected` if the connection has ended
    /// - `NetworkError::SendFailed` if the write fails
    pub async fn send(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(NetworkError::EmptyMessage.into());
        }
        if !self.is_connected() {
            return Err(NetworkError::NotConnected.into());
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetworkError::NotConnected)?;

        let send_failed = |e: std::io::Error| NetworkError::SendFailed {
            peer: self.server_addr.to_string(),
            reason: e.to_string(),
        };
        writer.write_all(text.as_bytes()).await.map_err(send_failed)?;
        writer.flush().await.map_err(send_failed)?;

        debug!(bytes = text.len(), "sent to relay");
        Ok(())
    }

    /// Wait for the next event
    ///
    /// Returns `None` once `Disconnected` has been consumed.
    pub async fn next_event(&self) -> Option<ClientEvent> {
        self.events.lock().await.recv().await
    }

    /// Whether the receive loop is still running
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Close the connection
    ///
    /// Idempotent. A `Disconnected` event is still delivered.
    pub async fn disconnect(&self) {
        self.close_signal.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Address of the relay
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Local address of this client's socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ClientEvent>,
    connected: watch::Sender<bool>,
    mut close: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; CLIENT_READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = close_requested(&mut close) => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let event = ClientEvent::Received {
                        content: buf[..n].to_vec(),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                },
                Err(error) => {
                    warn!(%error, "receive error");
                    break;
                },
            },
        }
    }

    connected.send_replace(false);
    let _ = events.send(ClientEvent::Disconnected);
    info!("receive loop ended");
}

async fn close_requested(close: &mut watch::Receiver<bool>) {
    let _ = close.wait_for(|closed| *closed).await;
}
