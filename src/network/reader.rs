//! Per-connection reader task
//!
//! Each accepted connection gets one reader task. It reads until
//! end-of-stream, a read error, or a close request, forwarding every
//! non-empty read verbatim as one message. Whatever the exit path, the
//! cleanup guard deregisters the connection exactly once.

use crate::api::events::{Event, EventHandlers};
use crate::network::broadcast::{Broadcaster, Message};
use crate::network::connection::Connection;
use crate::network::registry::Registry;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Shared handles every reader task needs
#[derive(Clone)]
pub(crate) struct ReaderContext {
    pub(crate) registry: Arc<Registry>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) events: EventHandlers,
    pub(crate) read_buffer_size: usize,
}

/// Why a reader loop ended
#[derive(Debug)]
enum ReaderExit {
    EndOfStream,
    CloseRequested,
    ReadFailed(std::io::Error),
}

/// Deregisters and releases a connection when dropped
///
/// Runs on normal exit, on read errors, and when the task is cancelled.
struct ReaderCleanup {
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    events: EventHandlers,
}

impl Drop for ReaderCleanup {
    fn drop(&mut self) {
        let conn = &self.connection;

        self.registry.remove(conn.id());
        conn.release();

        info!(
            peer = %conn.peer_addr(),
            connection_id = %conn.id(),
            bytes_received = conn.bytes_received(),
            bytes_sent = conn.bytes_sent(),
            "client disconnected"
        );

        self.events.dispatch(Event::ConnectionClosed {
            connection_id: conn.id(),
            peer_addr: conn.peer_addr(),
        });
    }
}

/// Drive one connection until it ends
///
/// The connection must already be registered. The cleanup guard is armed
/// before the returned future exists, so dropping the future unpolled
/// still deregisters the connection.
pub(crate) fn run_reader<R>(
    ctx: ReaderContext,
    connection: Arc<Connection>,
    reader: R,
) -> impl Future<Output = ()>
where
    R: AsyncRead + Unpin,
{
    let cleanup = ReaderCleanup {
        connection,
        registry: Arc::clone(&ctx.registry),
        events: ctx.events.clone(),
    };
    read_loop(ctx, cleanup, reader)
}

async fn read_loop<R>(ctx: ReaderContext, cleanup: ReaderCleanup, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let connection = Arc::clone(&cleanup.connection);
    let mut buf = vec![0u8; ctx.read_buffer_size];

    let exit = loop {
        let n = tokio::select! {
            biased;
            _ = connection.closed() => break ReaderExit::CloseRequested,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break ReaderExit::EndOfStream,
                Ok(n) => n,
                Err(e) => break ReaderExit::ReadFailed(e),
            },
        };

        connection.record_received(n);
        let message = Message::from_peer(connection.id(), &buf[..n]);

        info!(
            peer = %connection.peer_addr(),
            connection_id = %connection.id(),
            "{}",
            message.text().trim()
        );

        ctx.events.dispatch(Event::MessageReceived {
            connection_id: connection.id(),
            peer_addr: connection.peer_addr(),
            content: message.content().to_vec(),
        });

        ctx.broadcaster.fanout(&message).await;
    };

    match exit {
        ReaderExit::ReadFailed(error) => warn!(
            peer = %connection.peer_addr(),
            connection_id = %connection.id(),
            %error,
            "client read failed"
        ),
        other => debug!(
            peer = %connection.peer_addr(),
            connection_id = %connection.id(),
            reason = ?other,
            "reader finished"
        ),
    }

    drop(cleanup);
}
