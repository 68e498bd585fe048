//! Crane error types

use harbor_proto::ContainerError;
use harbor_tinker::TinkerError;
use harbor_transport::ShipError;
use thiserror::Error;

/// Errors raised by cranes, lines and conveyors
#[derive(Debug, Error)]
pub enum CraneError {
    /// Malformed shipment or container; fatal to the crane
    #[error("Framing error: {0}")]
    Framing(String),

    /// Handshake or decryption failure; fatal to the crane
    #[error("Crypto error: {0}")]
    Crypto(#[from] TinkerError),

    #[error("Transport error: {0}")]
    Transport(#[from] ShipError),

    #[error("Crane stopped")]
    Stopped,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Line rejected: {0}")]
    LineRejected(String),

    /// The line's inbound buffer overflowed; fatal to that line only
    #[error("Line {0} saturated")]
    LineSaturated(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ContainerError> for CraneError {
    fn from(e: ContainerError) -> Self {
        CraneError::Framing(e.to_string())
    }
}

impl CraneError {
    /// Whether this error must bring down the whole crane
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CraneError::Framing(_)
                | CraneError::Crypto(_)
                | CraneError::Transport(_)
                | CraneError::Stopped
        )
    }
}

pub type CraneResult<T> = Result<T, CraneError>;
