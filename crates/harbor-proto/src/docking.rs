//! Docking signals for local peer discovery
//!
//! Relays on the same network announce themselves with small datagrams:
//! `"BOTTLE" + <identity announcement>` carries an announcement, and a bare
//! `"SEAGULL"` asks every listening peer to announce itself.

use bytes::{BufMut, Bytes, BytesMut};

/// Prefix of an identity announcement datagram
pub const BOTTLE_PREFIX: &[u8] = b"BOTTLE";

/// Datagram asking peers to announce themselves
pub const SEAGULL: &[u8] = b"SEAGULL";

/// Default port for relay-to-relay cranes (TCP and UDP)
pub const RELAY_PORT: u16 = 17;

/// Default loopback port for the local client (TCP and UDP)
pub const CLIENT_PORT: u16 = 1117;

/// A parsed docking datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockingSignal {
    /// Identity announcement, opaque to the data-plane
    Bottle(Bytes),
    /// Request for announcements
    Seagull,
}

impl DockingSignal {
    pub fn encode(&self) -> Bytes {
        match self {
            DockingSignal::Bottle(data) => {
                let mut buf = BytesMut::with_capacity(BOTTLE_PREFIX.len() + data.len());
                buf.put_slice(BOTTLE_PREFIX);
                buf.put_slice(data);
                buf.freeze()
            }
            DockingSignal::Seagull => Bytes::from_static(SEAGULL),
        }
    }

    /// Parse a datagram. Unknown datagrams yield `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data == SEAGULL {
            return Some(DockingSignal::Seagull);
        }
        data.strip_prefix(BOTTLE_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(|rest| DockingSignal::Bottle(Bytes::copy_from_slice(rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seagull() {
        assert_eq!(DockingSignal::Seagull.encode().as_ref(), b"SEAGULL");
        assert_eq!(DockingSignal::parse(b"SEAGULL"), Some(DockingSignal::Seagull));
    }

    #[test]
    fn test_bottle() {
        let signal = DockingSignal::Bottle(Bytes::from_static(b"\x01\x02id"));
        let encoded = signal.encode();
        assert_eq!(&encoded[..6], b"BOTTLE");
        assert_eq!(DockingSignal::parse(&encoded), Some(signal));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(DockingSignal::parse(b"BOTTLE"), None);
        assert_eq!(DockingSignal::parse(b"SEAGULLS"), None);
        assert_eq!(DockingSignal::parse(b"hello"), None);
    }
}
