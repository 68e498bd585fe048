//! Relay identity records

use crate::keys::PublicExchangeKey;
use crate::{TinkerError, TinkerResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum serialized bottle size accepted from the network
pub const MAX_BOTTLE_SIZE: u64 = 16 * 1024;

/// Public identity of a relay.
///
/// Bottles travel as opaque bytes in announcements and docking signals; only
/// this crate looks inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    pub id: String,
    pub name: String,
    pub exchange_keys: Vec<PublicExchangeKey>,
    pub published_at: DateTime<Utc>,
}

impl Bottle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            exchange_keys: Vec::new(),
            published_at: Utc::now(),
        }
    }

    /// Create a bottle with a random relay ID
    pub fn generate(name: impl Into<String>) -> Self {
        let raw: [u8; 16] = rand::thread_rng().gen();
        Self::new(hex::encode(raw), name)
    }

    pub fn with_exchange_keys(mut self, keys: Vec<PublicExchangeKey>) -> Self {
        self.exchange_keys = keys;
        self
    }

    /// Pick the key to use for a new session: the valid key expiring last
    pub fn select_exchange_key(&self, now: DateTime<Utc>) -> Option<&PublicExchangeKey> {
        self.exchange_keys
            .iter()
            .filter(|k| !k.is_expired(now))
            .max_by_key(|k| k.expires)
    }

    pub fn to_bytes(&self) -> TinkerResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TinkerError::Identity(format!("Failed to encode bottle: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> TinkerResult<Self> {
        if data.len() as u64 > MAX_BOTTLE_SIZE {
            return Err(TinkerError::Identity(format!(
                "Bottle too large: {} bytes",
                data.len()
            )));
        }
        bincode::deserialize(data)
            .map_err(|e| TinkerError::Identity(format!("Failed to decode bottle: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRing;
    use chrono::Duration;

    #[test]
    fn test_bottle_bytes() {
        let ring = KeyRing::new();
        ring.generate(Duration::hours(1));
        let bottle = Bottle::generate("Port2").with_exchange_keys(ring.public_keys(Utc::now()));

        let data = bottle.to_bytes().unwrap();
        let decoded = Bottle::from_bytes(&data).unwrap();
        assert_eq!(decoded, bottle);
        assert_eq!(decoded.id.len(), 32);
    }

    #[test]
    fn test_select_exchange_key_skips_expired() {
        let ring = KeyRing::new();
        let expired = ring.generate(Duration::seconds(-5));
        let valid = ring.generate(Duration::hours(2));
        let bottle = Bottle::new("r1", "Port3").with_exchange_keys(vec![expired, valid.clone()]);

        assert_eq!(bottle.select_exchange_key(Utc::now()), Some(&valid));
        assert!(Bottle::new("r2", "Port4")
            .select_exchange_key(Utc::now())
            .is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Bottle::from_bytes(&[0xff, 0xff, 0xff]),
            Err(TinkerError::Identity(_))
        ));
    }
}
