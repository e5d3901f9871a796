//! TCP listener and accept loop

use crate::api::events::Event;
use crate::error::{NetworkError, Result};
use crate::network::connection::Connection;
use crate::network::reader::{run_reader, ReaderContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Pause after an unexpected accept error so a persistent fault
/// (e.g. file descriptor exhaustion) does not spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Bound TCP listener for incoming relay connections
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind the listening endpoint
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::BindFailed` if the address is unavailable,
    /// for example because another process already listens on it.
    pub async fn bind(address: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(address)
                .await
                .map_err(|e| NetworkError::BindFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self { listener })
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// Accept connections until `shutdown` flips to `true`
///
/// Every accepted connection is registered before its reader task is
/// spawned. On shutdown the listener is closed first, then every live
/// connection is asked to close, and the loop waits for all reader tasks
/// to finish their cleanup.
pub(crate) async fn run_accept_loop(
    listener: Listener,
    ctx: ReaderContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (connection, read_half) = Connection::accept(stream, peer_addr);
                    let connection = Arc::new(connection);

                    info!(
                        peer = %peer_addr,
                        connection_id = %connection.id(),
                        "client connected"
                    );

                    ctx.registry.add(&connection);
                    ctx.events.dispatch(Event::ConnectionAccepted {
                        connection_id: connection.id(),
                        peer_addr,
                    });

                    readers.spawn(run_reader(ctx.clone(), connection, read_half));
                },
                Err(error) => {
                    error!(%error, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                },
            },
            Some(finished) = readers.join_next(), if !readers.is_empty() => {
                if let Err(join_error) = finished {
                    error!(error = %join_error, "reader task ended abnormally");
                }
            },
        }
    }

    drop(listener);

    let live = ctx.registry.snapshot();
    info!(connections = live.len(), "listener stopped, closing connections");
    for connection in live {
        connection.close();
    }

    while let Some(finished) = readers.join_next().await {
        if let Err(join_error) = finished {
            error!(error = %join_error, "reader task ended abnormally");
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_bind_random_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(addr).await.unwrap();

        let bound_addr = listener.local_addr().unwrap();
        assert_eq!(
            bound_addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_ne!(bound_addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_occupied_endpoint_fails() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let result = Listener::bind(taken).await;
        assert!(matches!(
            result,
            Err(crate::error::RelayError::Network(
                NetworkError::BindFailed { .. }
            ))
        ));
    }
}
