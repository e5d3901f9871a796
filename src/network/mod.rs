//! Network module
//!
//! Connection handling for the relay: accepting TCP sessions, tracking the
//! live ones, reading from each, and fanning messages out to the rest.
//!
//! There is no framing. Whatever one read returns is one message, so a
//! message may arrive split or merged with its neighbour if the transport
//! delivers it that way.

mod broadcast;
mod client;
mod connection;
pub(crate) mod listener;
pub(crate) mod reader;
mod registry;

pub use broadcast::{Broadcaster, FanoutReport, Message, Origin};
pub use client::{ClientEvent, RelayClient};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use listener::Listener;
pub use registry::Registry;
