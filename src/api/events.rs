//! Event system for the local front end
//!
//! The relay reports what happens on the wire through [`Event`]s. A front end
//! (terminal, GUI, service manager) subscribes with a callback; this is how
//! received messages reach the local display.

use parking_lot::RwLock;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::ConnectionId;

/// Events that can be delivered to application handlers
#[derive(Debug, Clone)]
pub enum Event {
    /// The relay bound its endpoint and is accepting connections
    RelayStarted {
        /// Address actually bound (resolves port 0)
        local_addr: SocketAddr,
    },

    /// The relay stopped and all connections are closed
    RelayStopped,

    /// A peer connected and was registered
    ConnectionAccepted {
        /// Identity of the new connection
        connection_id: ConnectionId,
        /// Remote address of the peer
        peer_addr: SocketAddr,
    },

    /// A peer sent a message (one read's worth of bytes)
    MessageReceived {
        /// Connection the message was read from
        connection_id: ConnectionId,
        /// Remote address of the sender
        peer_addr: SocketAddr,
        /// Raw payload
        content: Vec<u8>,
    },

    /// Delivering a broadcast to one recipient failed
    SendFailed {
        /// Recipient connection
        connection_id: ConnectionId,
        /// Recipient address
        peer_addr: SocketAddr,
        /// Failure description
        reason: String,
    },

    /// A connection was deregistered and closed
    ConnectionClosed {
        /// Identity of the closed connection
        connection_id: ConnectionId,
        /// Remote address of the peer
        peer_addr: SocketAddr,
    },
}

impl Event {
    /// Text of a received message, decoded lossily
    ///
    /// Returns `None` for every other event.
    pub fn message_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Event::MessageReceived { content, .. } => Some(String::from_utf8_lossy(content)),
            _ => None,
        }
    }
}

/// Handle for unsubscribing from events
///
/// Dropping the handle does NOT unsubscribe; call `unsubscribe` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Type alias for event handler callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Manages event subscriptions and delivery
///
/// Cloning is cheap and every clone shares the same set of handlers.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<RwLock<u64>>,
}

impl EventHandlers {
    /// Create a new event handler registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler
    ///
    /// The handler is called from relay tasks, so it must be thread-safe.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.write();
        let handle = SubscriptionHandle(*next_id);
        *next_id += 1;

        self.handlers.write().push((handle, Arc::new(callback)));

        handle
    }

    /// Unsubscribe an event handler
    ///
    /// If the handle is not found, this is a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Dispatch an event to all registered handlers
    ///
    /// Handlers are called in registration order. A panicking handler is
    /// logged and skipped; the rest still run.
    pub fn dispatch(&self, event: Event) {
        // Clone the list so handlers may subscribe/unsubscribe re-entrantly
        let handlers: Vec<_> = self.handlers.read().clone();

        for (handle, callback) in handlers.iter() {
            let event_clone = event.clone();

            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            })) {
                tracing::error!(
                    "Event handler {:?} panicked: {:?}",
                    handle,
                    e.downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                );
            }
        }
    }

    /// Get the number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn received(text: &str) -> Event {
        Event::MessageReceived {
            connection_id: ConnectionId::next(),
            peer_addr: "127.0.0.1:5001".parse().unwrap(),
            content: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_message_text() {
        assert_eq!(received("hi").message_text().as_deref(), Some("hi"));
        assert!(Event::RelayStopped.message_text().is_none());
    }

    #[test]
    fn test_event_handlers_multiple_subscribers() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            handlers.subscribe(move |_event| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        handlers.dispatch(Event::RelayStopped);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_handlers_unsubscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });
        assert_eq!(handlers.handler_count(), 1);

        handlers.unsubscribe(handle);
        handlers.unsubscribe(handle);
        handlers.dispatch(received("ignored"));

        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(handlers.handler_count(), 0);
    }

    #[test]
    fn test_event_handlers_panic_isolation() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        handlers.subscribe(|_event| {
            panic!("Handler panic");
        });

        let count_clone = Arc::clone(&count);
        handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.dispatch(Event::RelayStopped);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_handlers() {
        let handlers = EventHandlers::new();
        let clone = handlers.clone();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        clone.subscribe(move |_| called_clone.store(true, Ordering::SeqCst));
        handlers.dispatch(Event::RelayStopped);

        assert!(called.load(Ordering::SeqCst));
    }
}
