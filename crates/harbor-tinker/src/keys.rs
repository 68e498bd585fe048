//! Exchange keys and the local key ring

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

/// Public half of an exchange key, as published in a [`Bottle`](crate::Bottle)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicExchangeKey {
    pub id: u32,
    pub key: [u8; 32],
    pub expires: DateTime<Utc>,
}

impl PublicExchangeKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        PublicKey::from(self.key)
    }
}

/// A private exchange key held by a relay
pub struct ExchangeKey {
    id: u32,
    secret: StaticSecret,
    public: PublicKey,
    expires: DateTime<Utc>,
}

impl ExchangeKey {
    /// Generate a fresh key valid for `validity`
    pub fn generate(id: u32, validity: Duration) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(id, secret, Utc::now() + validity)
    }

    /// Restore a key from its secret bytes
    pub fn from_bytes(id: u32, secret: [u8; 32], expires: DateTime<Utc>) -> Self {
        Self::from_secret(id, StaticSecret::from(secret), expires)
    }

    fn from_secret(id: u32, secret: StaticSecret, expires: DateTime<Utc>) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            id,
            secret,
            public,
            expires,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public(&self) -> PublicExchangeKey {
        PublicExchangeKey {
            id: self.id,
            key: self.public.to_bytes(),
            expires: self.expires,
        }
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for ExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeKey")
            .field("id", &self.id)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

/// The exchange keys a relay can answer handshakes with
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: Arc<RwLock<BTreeMap<u32, Arc<ExchangeKey>>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, replacing any key with the same ID
    pub fn insert(&self, key: ExchangeKey) {
        if let Ok(mut keys) = self.keys.write() {
            debug!(key_id = key.id, expires = %key.expires, "Adding exchange key");
            keys.insert(key.id, Arc::new(key));
        }
    }

    /// Generate and add a new key with the next free ID
    pub fn generate(&self, validity: Duration) -> PublicExchangeKey {
        let mut keys = match self.keys.write() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = keys.keys().next_back().map_or(1, |last| last.wrapping_add(1));
        let key = ExchangeKey::generate(id, validity);
        let public = key.public();
        debug!(key_id = id, expires = %public.expires, "Generated exchange key");
        keys.insert(id, Arc::new(key));
        public
    }

    pub fn get(&self, id: u32) -> Option<Arc<ExchangeKey>> {
        self.keys.read().ok()?.get(&id).cloned()
    }

    /// Public halves of all keys that are still valid
    pub fn public_keys(&self, now: DateTime<Utc>) -> Vec<PublicExchangeKey> {
        self.keys
            .read()
            .map(|keys| {
                keys.values()
                    .filter(|k| !k.is_expired(now))
                    .map(|k| k.public())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The valid key that expires last
    pub fn newest(&self, now: DateTime<Utc>) -> Option<PublicExchangeKey> {
        let keys = self.keys.read().ok()?;
        keys.values()
            .filter(|k| !k.is_expired(now))
            .max_by_key(|k| k.expires)
            .map(|k| k.public())
    }

    /// Remove expired keys, returning how many were dropped
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut keys) = self.keys.write() else {
            return 0;
        };
        let before = keys.len();
        keys.retain(|_, k| !k.is_expired(now));
        before - keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
