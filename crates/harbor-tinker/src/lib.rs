//! Session encryption for cranes and lines
//!
//! A tinker session is set up by one side (the initiator) from the public
//! exchange keys of the other side (the responder). The initiator sends a small
//! handshake block; the responder combines it with its private exchange keys to
//! arrive at the same pair of directional keys.
//!
//! Sessions are split into a [`Sealer`] for the sending direction and an
//! [`Opener`] for the receiving direction. Both are stateful (nonce counters),
//! so each must be driven by a single task at a time.

pub mod bottle;
pub mod keys;
pub mod session;

pub use bottle::Bottle;
pub use keys::{ExchangeKey, KeyRing, PublicExchangeKey};
pub use session::{Handshake, Opener, Sealer, Session, TAG_LEN};

use thiserror::Error;

/// Tinker errors
#[derive(Debug, Error)]
pub enum TinkerError {
    #[error("Unknown exchange key: {0}")]
    UnknownKey(u32),

    #[error("No usable exchange key")]
    NoUsableKey,

    #[error("Unsupported tool suite: {0}")]
    UnsupportedSuite(u16),

    #[error("Decryption failed")]
    Decrypt,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Identity error: {0}")]
    Identity(String),
}

/// Result type for tinker operations
pub type TinkerResult<T> = Result<T, TinkerError>;

/// Wire ID meaning "no encryption" in line initializers
pub const NO_TOOL_SUITE: u16 = 0;

/// Supported cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ToolSuite {
    /// X25519 agreement, HKDF-SHA256 derivation, ChaCha20-Poly1305 sealing
    X25519ChaCha20Poly1305 = 1,
}

impl ToolSuite {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolSuite::X25519ChaCha20Poly1305 => "X25519_HKDF_SHA256_CHACHA20POLY1305",
        }
    }
}

impl Default for ToolSuite {
    fn default() -> Self {
        ToolSuite::X25519ChaCha20Poly1305
    }
}

impl TryFrom<u16> for ToolSuite {
    type Error = TinkerError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ToolSuite::X25519ChaCha20Poly1305),
            other => Err(TinkerError::UnsupportedSuite(other)),
        }
    }
}

impl std::fmt::Display for ToolSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
