//! High-level API for the relay
//!
//! This module provides the public-facing API a front end uses: build and
//! run a relay, send local messages, and subscribe to events.

pub mod config;
pub mod events;
pub mod relay;

// Re-export main types for convenience
pub use config::RelayConfig;
pub use events::{Event, EventHandlers, SubscriptionHandle};
pub use relay::{Relay, RelayBuilder, RelayState};
