//! Harbor Protocol Definitions
//!
//! This crate defines the wire-level building blocks shared by every part of the
//! relay data-plane: self-describing varints, the prepend-capable [`Container`],
//! the crane [`Initializer`], controller messages, API frames and docking signals.

pub mod api;
pub mod container;
pub mod docking;
pub mod messages;
pub mod varint;

pub use api::{ApiFrame, ApiMsgType};
pub use container::{Container, ContainerError};
pub use docking::DockingSignal;
pub use messages::{AnnouncementScope, ControllerMsg, Initializer};

/// Protocol version carried in every [`Initializer`]
pub const PROTOCOL_VERSION: u8 = 1;

/// Reserved line ID addressing the crane controller
pub const CONTROLLER_LINE_ID: u32 = 0;

/// Plaintext size of every shipment, including the length prefix
pub const SHIPMENT_SIZE: usize = 4096;

/// Bytes reserved at the front of a shipment for the data length varint
pub const SHIPMENT_PREFIX_SIZE: usize = 2;

/// Maximum payload carried by one shipment
pub const MAX_SHIPMENT_DATA: usize = SHIPMENT_SIZE - SHIPMENT_PREFIX_SIZE;

/// Maximum size of a single container inside a shipment stream
pub const MAX_CONTAINER_SIZE: usize = 8192;

/// Maximum ciphertext length accepted for one wire segment
pub const MAX_WIRE_SIZE: usize = 8192;

/// Default per-line buffer capacity, counted in containers
pub const DEFAULT_SHORE_CAP: u32 = 100;
