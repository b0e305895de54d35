//! Socket configuration.
//!
//! The values are read-only inputs captured when a socket is built; nothing
//! in the protocol engine changes them afterwards.

use std::time::Duration;

use thiserror::Error;

/// Tunables shared by client and server sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Window size in segments.
    ///
    /// The client never has more segments in flight than the server last
    /// advertised; the server's receive buffer holds this many chunks.  The
    /// wire field is one byte, hence `u8`.
    pub window: u8,
    /// Retransmission timeout, also the wait between handshake attempts.
    pub timeout: Duration,
    /// Handshake and teardown attempts before giving up.
    pub retries: u32,
    /// Verbose protocol logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: 100,
            timeout: Duration::from_millis(100),
            retries: 20,
            debug: false,
        }
    }
}

impl Config {
    pub fn with_window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Reject values the protocol cannot make progress with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("window must hold at least one segment")]
    ZeroWindow,
    #[error("timeout must be non-zero")]
    ZeroTimeout,
    #[error("at least one connection attempt is required")]
    ZeroRetries,
}
