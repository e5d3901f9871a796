//! Configuration for the relay
//!
//! The only external surface is the listening endpoint; the remaining fields
//! are tuning knobs with defaults that match the classic chat server (port
//! 5000, 4 KiB reads). Configuration can be kept as human-readable JSON.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default listening port
pub const DEFAULT_PORT: u16 = 5000;

/// Default size of the per-connection read buffer; one read is one message
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default deadline for a single write to a recipient
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Endpoint to accept connections on
    ///
    /// Port 0 picks a random available port.
    pub listen_addr: SocketAddr,

    /// Bytes requested per read; an inbound message is at most this long
    pub read_buffer_size: usize,

    /// How long a single recipient write may take before it is dropped
    ///
    /// A dropped write may have sent part of its message already; the
    /// recipient's next message then follows the truncated bytes directly.
    pub write_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

impl RelayConfig {
    /// Per-recipient write deadline
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `read_buffer_size` is 0
    /// - `write_timeout_ms` is 0
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read_buffer_size".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "write_timeout_ms".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Load and validate a configuration from a JSON file
    ///
    /// Fields missing from the file take their default values.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = serde_json::from_str(&json).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        std::fs::write(path, json).map_err(|e| ConfigError::FileAccess {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}
