//! Ship abstraction for the relay data-plane
//!
//! A ship is an ordered, reliable, bidirectional byte stream between two
//! adjacent relays. It guarantees no message boundaries: whatever is loaded on
//! one side comes out of the other side in order, in arbitrarily sized pieces.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Crane                     │
//! │   loader ──► load()     unload_to() ──►   │
//! └──────────────────────────────────────────┘
//!                     │ uses trait
//!                     ↓
//! ┌──────────────┬─────────────────┬─────────┐
//! │ MemoryShip   │ TcpShip         │ Future  │
//! │ (tests)      │ (harbor-        │ ships   │
//! │              │  transport-tcp) │         │
//! └──────────────┴─────────────────┴─────────┘
//! ```

pub mod memory;

pub use memory::MemoryShip;

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

/// Ship-level errors
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("Ship sunk")]
    Sunk,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transient errors persisted for {0} attempts")]
    TransientExhausted(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for ship operations
pub type ShipResult<T> = Result<T, ShipError>;

/// A reliable duplex byte pipe between two relays
///
/// `load` and `unload_to` may be called concurrently from different tasks;
/// implementations serialize each direction internally.
#[async_trait]
pub trait Ship: Send + Sync + Debug {
    /// Send all of `data`.
    ///
    /// Returns `Ok(false)` if the ship is already sunk. On a write error the
    /// ship sinks and the error is returned.
    async fn load(&self, data: &[u8]) -> ShipResult<bool>;

    /// Receive bytes into `buf`.
    ///
    /// Returns `Ok(Some(n))` with `n > 0`, or `Ok(None)` once the ship is sunk
    /// (peer closed or local [`sink`](Ship::sink)).
    async fn unload_to(&self, buf: &mut [u8]) -> ShipResult<Option<usize>>;

    /// Whether this side dialed the connection
    fn is_mine(&self) -> bool;

    /// Close the ship. Idempotent.
    async fn sink(&self);

    fn is_sunk(&self) -> bool;

    /// Short transport name for logging ("tcp", "memory")
    fn transport_name(&self) -> &'static str;

    /// Human-readable address of the remote end
    fn remote_address(&self) -> String;
}
