//! TCP ship configuration

use std::time::Duration;

/// Banner served to anything that connects without speaking the crane protocol
pub const DEFAULT_BANNER: &str =
    "\"The sea, once it casts its spell, holds one in its net of wonder forever.\" - Jacques Cousteau\r\n";

/// TCP-specific configuration
#[derive(Debug, Clone)]
pub struct TcpShipConfig {
    /// Deadline for establishing an outgoing connection
    pub connect_timeout: Duration,

    /// How long an incoming connection may stay silent before it is served the banner
    pub first_read_timeout: Duration,

    /// How many consecutive transient I/O errors are retried before the ship sinks
    pub max_transient_retries: usize,

    /// Quote-of-the-day banner for unknown clients
    pub banner: String,

    /// Name reported on the plain-text info page served to HTTP probes
    pub info_name: String,
}

impl Default for TcpShipConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            first_read_timeout: Duration::from_secs(1),
            max_transient_retries: 1000,
            banner: DEFAULT_BANNER.to_string(),
            info_name: "harbor relay".to_string(),
        }
    }
}

impl TcpShipConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_first_read_timeout(mut self, timeout: Duration) -> Self {
        self.first_read_timeout = timeout;
        self
    }

    pub fn with_info_name(mut self, name: impl Into<String>) -> Self {
        self.info_name = name.into();
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }
}
