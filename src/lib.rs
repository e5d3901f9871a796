//! # chat-relay
//!
//! A text broadcast relay. One process accepts any number of TCP peers and
//! forwards every message received from one peer to all the others.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chat_relay::RelayBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayBuilder::new()
//!         .with_listen_port(5000)
//!         .build()?;
//!
//!     relay.on_event(|event| {
//!         if let Some(text) = event.message_text() {
//!             println!("{}", text);
//!         }
//!     });
//!
//!     relay.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     relay.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod error;
pub mod network;

// Re-export main types
pub use api::{
    Event, EventHandlers, Relay, RelayBuilder, RelayConfig, RelayState, SubscriptionHandle,
};
pub use error::{ConfigError, NetworkError, RelayError, Result};
pub use network::{
    ClientEvent, Connection, ConnectionId, FanoutReport, Message, Origin, Registry, RelayClient,
};
