//! Crane configuration

use harbor_proto::{
    DEFAULT_SHORE_CAP, MAX_CONTAINER_SIZE, MAX_WIRE_SIZE, SHIPMENT_SIZE,
};
use std::time::Duration;

/// Crane configuration
#[derive(Debug, Clone)]
pub struct CraneConfig {
    /// Largest container accepted inside a shipment stream
    pub max_container_size: usize,

    /// Plaintext size of every shipment
    pub max_shipment_size: usize,

    /// Largest ciphertext segment accepted from the ship
    pub max_wire_size: usize,

    /// How long a partially filled shipment may wait for more data
    pub flush_delay: Duration,

    /// Inbound buffer capacity of new lines, in containers
    pub default_shore_cap: u32,

    /// Deadline for the initial key exchange on a new ship
    pub handshake_timeout: Duration,

    /// Deadline for the peer to answer a new line request
    pub line_setup_timeout: Duration,

    /// Depth of the queue from all lines to the loader
    pub to_ship_depth: usize,

    /// Depth of the queue from the unloader to the handler
    pub from_ship_depth: usize,

    /// Depth of the queues between conveyor links
    pub link_depth: usize,
}

impl Default for CraneConfig {
    fn default() -> Self {
        Self {
            max_container_size: MAX_CONTAINER_SIZE,
            max_shipment_size: SHIPMENT_SIZE,
            max_wire_size: MAX_WIRE_SIZE,
            flush_delay: Duration::from_millis(1),
            default_shore_cap: DEFAULT_SHORE_CAP,
            handshake_timeout: Duration::from_secs(3),
            line_setup_timeout: Duration::from_secs(3),
            to_ship_depth: 64,
            from_ship_depth: 16,
            link_depth: 8,
        }
    }
}

impl CraneConfig {
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn with_shore_cap(mut self, cap: u32) -> Self {
        self.default_shore_cap = cap.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_line_setup_timeout(mut self, timeout: Duration) -> Self {
        self.line_setup_timeout = timeout;
        self
    }

    pub fn with_max_container_size(mut self, size: usize) -> Self {
        self.max_container_size = size;
        self
    }
}
