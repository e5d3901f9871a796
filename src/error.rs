//! Error types for the relay

use crate::api::relay::RelayState;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation not allowed in the relay's current lifecycle state
    #[error("Cannot {operation} while relay is {state:?}")]
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state the relay was in
        state: RelayState,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The listening endpoint could not be bound
    #[error("Failed to bind {address}: {reason}")]
    BindFailed {
        /// Endpoint that was requested
        address: String,
        /// Underlying reason
        reason: String,
    },

    /// An outgoing connection could not be established
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed {
        /// Remote address
        address: String,
        /// Underlying reason
        reason: String,
    },

    /// The connection has already been closed
    #[error("Connection to {peer} is closed")]
    ConnectionClosed {
        /// Peer address
        peer: String,
    },

    /// A write to a peer failed
    #[error("Send to {peer} failed: {reason}")]
    SendFailed {
        /// Peer address
        peer: String,
        /// Underlying reason
        reason: String,
    },

    /// A write to a peer did not complete in time and was dropped
    #[error("Send to {peer} timed out after {timeout_ms}ms")]
    WriteTimeout {
        /// Peer address
        peer: String,
        /// Configured write timeout
        timeout_ms: u64,
    },

    /// Client is not connected to a relay
    #[error("Not connected to relay")]
    NotConnected,

    /// Refused to send an empty or whitespace-only message
    #[error("Empty message; not sent")]
    EmptyMessage,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration file could not be read or written
    #[error("Cannot access config file {path}: {reason}")]
    FileAccess {
        /// Path to the config file
        path: PathBuf,
        /// Underlying reason
        reason: String,
    },

    /// Configuration file is not valid JSON for this schema
    #[error("Malformed config file {path}: {reason}")]
    Malformed {
        /// Path to the config file
        path: PathBuf,
        /// Parser message
        reason: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
