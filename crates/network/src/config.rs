use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for [`crate::NetworkEndpoint`] and the connections it accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Size of the buffer each connection reads into. Bounds the size of a
    /// single data chunk.
    pub read_buffer_size: usize,

    /// How long the accept thread sleeps when no connection is pending
    pub accept_poll_interval_ms: u64,
}

impl NetworkConfig {
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 65536;
    pub const DEFAULT_ACCEPT_POLL_INTERVAL_MS: u64 = 10;

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    /// Check the values are usable
    ///
    /// # Errors
    ///
    /// Returns an error if the read buffer size or the poll interval is zero
    pub fn validate(&self) -> eyre::Result<()> {
        if self.read_buffer_size == 0 {
            eyre::bail!("read_buffer_size must be greater than zero");
        }
        if self.accept_poll_interval_ms == 0 {
            eyre::bail!("accept_poll_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
            accept_poll_interval_ms: Self::DEFAULT_ACCEPT_POLL_INTERVAL_MS,
        }
    }
}
