//! Relay implementation - the main entry point
//!
//! This module provides the `Relay` and `RelayBuilder` types. A relay binds
//! one endpoint, accepts any number of peers, and forwards every message a
//! peer sends to all other peers. Lifecycle and local messaging are plain
//! function calls, so any front end can drive them.

use crate::api::config::RelayConfig;
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::error::{RelayError, Result};
use crate::network::listener::{run_accept_loop, Listener};
use crate::network::reader::ReaderContext;
use crate::network::{Broadcaster, FanoutReport, Message, Registry};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Current operational state of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Relay has been created but not started
    Created,
    /// Relay is binding its endpoint
    Starting,
    /// Relay is accepting connections and forwarding messages
    Running,
    /// Relay is closing connections
    Stopping,
    /// Relay has stopped (it may be started again)
    Stopped,
}

/// Builder for creating Relay instances
///
/// # Examples
///
/// ```no_run
/// use chat_relay::RelayBuilder;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let relay = RelayBuilder::new()
///     .with_listen_port(5000)
///     .build()?;
///
/// let addr = relay.start().await?;
/// println!("relaying on {}", addr);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct RelayBuilder {
    config: RelayConfig,
}

impl RelayBuilder {
    /// Create a new RelayBuilder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the endpoint to accept connections on
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set only the listening port, keeping the bind address
    ///
    /// Port 0 picks a random available port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.config.listen_addr.set_port(port);
        self
    }

    /// Set the per-connection read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the per-recipient write deadline
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build the Relay instance
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Relay> {
        self.config.validate()?;

        let registry = Arc::new(Registry::new());
        let events = EventHandlers::new();
        let broadcaster = Broadcaster::new(
            Arc::clone(&registry),
            self.config.write_timeout(),
            events.clone(),
        );

        Ok(Relay {
            config: self.config,
            registry,
            broadcaster,
            events,
            state: RwLock::new(RelayState::Created),
            running: Mutex::new(None),
        })
    }
}

/// Handles owned while the accept loop runs
struct RunningListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A broadcast relay
///
/// All methods take `&self`, so a relay can be shared (e.g. in an `Arc`)
/// between a front end's input task and its shutdown handler.
///
/// # Examples
///
/// ```no_run
/// use chat_relay::{Event, RelayBuilder};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let relay = RelayBuilder::new().build()?;
///
/// relay.on_event(|event| {
///     if let Some(text) = event.message_text() {
///         println!("{}", text);
///     }
/// });
///
/// relay.start().await?;
/// relay.send_local(b"server says hello").await?;
/// relay.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Relay {
    config: RelayConfig,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    events: EventHandlers,
    state: RwLock<RelayState>,
    running: Mutex<Option<RunningListener>>,
}

impl Relay {
    // ========================================================================
    // Lifecycle Methods
    // ========================================================================

    /// Bind the endpoint and start accepting connections
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The relay is not in the Created or Stopped state
    /// - The endpoint cannot be bound (fatal; no accept loop is started)
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write();
            if *state != RelayState::Created && *state != RelayState::Stopped {
                return Err(RelayError::InvalidState {
                    operation: "start",
                    state: *state,
                });
            }
            *state = RelayState::Starting;
        }

        let (listener, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                error!(address = %self.config.listen_addr, error = %e, "bind failed");
                *self.state.write() = RelayState::Stopped;
                return Err(e);
            },
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = ReaderContext {
            registry: Arc::clone(&self.registry),
            broadcaster: self.broadcaster.clone(),
            events: self.events.clone(),
            read_buffer_size: self.config.read_buffer_size,
        };
        let task = tokio::spawn(run_accept_loop(listener, ctx, shutdown_rx));

        *self.running.lock() = Some(RunningListener {
            local_addr,
            shutdown,
            task,
        });
        *self.state.write() = RelayState::Running;

        info!(%local_addr, "server started");
        self.events.dispatch(Event::RelayStarted { local_addr });

        Ok(local_addr)
    }

    async fn bind(&self) -> Result<(Listener, SocketAddr)> {
        let listener = Listener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Stop accepting, close every connection, and wait for cleanup
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is not running.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != RelayState::Running {
                return Err(RelayError::InvalidState {
                    operation: "stop",
                    state: *state,
                });
            }
            *state = RelayState::Stopping;
        }

        let running = self.running.lock().take();
        if let Some(running) = running {
            running.shutdown.send_replace(true);
            if let Err(join_error) = running.task.await {
                error!(error = %join_error, "accept loop ended abnormally");
            }
        }

        *self.state.write() = RelayState::Stopped;

        info!("server stopped");
        self.events.dispatch(Event::RelayStopped);

        Ok(())
    }

    /// Get the current operational state
    pub fn state(&self) -> RelayState {
        *self.state.read()
    }

    /// Address the relay is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Number of currently registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// The configuration this relay was built with
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ========================================================================
    // Local Messaging
    // ========================================================================

    /// Send a locally originated message to every connected peer
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is not running. Per-peer delivery
    /// failures are reported in the returned `FanoutReport`, not as errors.
    pub async fn send_local(&self, content: &[u8]) -> Result<FanoutReport> {
        let state = self.state();
        if state != RelayState::Running {
            return Err(RelayError::InvalidState {
                operation: "send",
                state,
            });
        }

        Ok(self.broadcaster.fanout(&Message::local(content)).await)
    }

    // ========================================================================
    // Event System
    // ========================================================================

    /// Register an event handler
    ///
    /// Handlers run on relay tasks, not on the caller's thread.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Unsubscribe an event handler
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.events.unsubscribe(handle);
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        // Without this the accept loop would outlive the relay
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.send_replace(true);
        }
    }
}
