//! Handshake and directional session halves

use crate::keys::{KeyRing, PublicExchangeKey};
use crate::{TinkerError, TinkerResult, ToolSuite};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Authentication tag overhead added by [`Sealer::seal`]
pub const TAG_LEN: usize = 16;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const INFO_INITIATOR: &[u8] = b"harbor tinker v1 initiator->responder";
const INFO_RESPONDER: &[u8] = b"harbor tinker v1 responder->initiator";

/// Key exchange material sent by the initiator.
///
/// Layout: `<32 bytes: ephemeral public key> <32 bytes: salt>`
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub ephemeral: [u8; 32],
    pub salt: [u8; SALT_LEN],
}

impl Handshake {
    pub const LEN: usize = 32 + SALT_LEN;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.salt);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> TinkerResult<Self> {
        if data.len() != Self::LEN {
            return Err(TinkerError::MalformedHandshake(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                data.len()
            )));
        }
        let mut ephemeral = [0u8; 32];
        let mut salt = [0u8; SALT_LEN];
        ephemeral.copy_from_slice(&data[..32]);
        salt.copy_from_slice(&data[32..]);
        Ok(Self { ephemeral, salt })
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake").finish_non_exhaustive()
    }
}

fn nonce_for(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypting half of a session
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Sealer {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Encrypt `plaintext`; the output is [`TAG_LEN`] bytes longer
    pub fn seal(&mut self, plaintext: &[u8]) -> TinkerResult<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(TinkerError::NonceExhausted);
        }
        let nonce = nonce_for(self.counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TinkerError::Encrypt)?;
        self.counter += 1;
        Ok(sealed)
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Decrypting half of a session
pub struct Opener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Opener {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Decrypt and authenticate `ciphertext`.
    ///
    /// Messages must be opened in the order they were sealed.
    pub fn open(&mut self, ciphertext: &[u8]) -> TinkerResult<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(TinkerError::NonceExhausted);
        }
        let nonce = nonce_for(self.counter);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| TinkerError::Decrypt)?;
        self.counter += 1;
        Ok(opened)
    }
}

impl fmt::Debug for Opener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opener")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// An established session
#[derive(Debug)]
pub struct Session {
    pub suite: ToolSuite,
    pub sealer: Sealer,
    pub opener: Opener,
}

fn derive_keys(
    shared: &[u8],
    salt: &[u8; SALT_LEN],
    ephemeral: &[u8; 32],
    server_keys: &[[u8; 32]],
) -> TinkerResult<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);

    let mut transcript = Vec::with_capacity(32 * (1 + server_keys.len()));
    transcript.extend_from_slice(ephemeral);
    for key in server_keys {
        transcript.extend_from_slice(key);
    }

    let mut to_responder = [0u8; KEY_LEN];
    let mut to_initiator = [0u8; KEY_LEN];
    hk.expand_multi_info(&[INFO_INITIATOR, &transcript[..]], &mut to_responder)
        .map_err(|_| TinkerError::MalformedHandshake("key derivation failed".into()))?;
    hk.expand_multi_info(&[INFO_RESPONDER, &transcript[..]], &mut to_initiator)
        .map_err(|_| TinkerError::MalformedHandshake("key derivation failed".into()))?;

    Ok((to_responder, to_initiator))
}

impl Session {
    /// Start a session towards the holder of `server_keys`.
    ///
    /// One ephemeral key is agreed with every listed server key; the responder
    /// needs all of them to derive the session.
    pub fn initiate(
        suite: ToolSuite,
        server_keys: &[PublicExchangeKey],
    ) -> TinkerResult<(Session, Handshake)> {
        if server_keys.is_empty() {
            return Err(TinkerError::NoUsableKey);
        }

        // Agreed once per server key, then dropped with the session setup
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

        let mut combined = Vec::with_capacity(32 * server_keys.len());
        for key in server_keys {
            let shared = ephemeral.diffie_hellman(&key.public_key());
            if !shared.was_contributory() {
                return Err(TinkerError::NoUsableKey);
            }
            combined.extend_from_slice(shared.as_bytes());
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let server_publics: Vec<[u8; 32]> = server_keys.iter().map(|k| k.key).collect();
        let (to_responder, to_initiator) =
            derive_keys(&combined, &salt, &ephemeral_public, &server_publics)?;

        let session = Session {
            suite,
            sealer: Sealer::new(&to_responder),
            opener: Opener::new(&to_initiator),
        };
        let handshake = Handshake {
            ephemeral: ephemeral_public,
            salt,
        };
        Ok((session, handshake))
    }

    /// Answer a handshake using the private keys named in `key_ids`
    pub fn respond(
        suite: ToolSuite,
        key_ids: &[u32],
        handshake: &Handshake,
        keys: &KeyRing,
    ) -> TinkerResult<Session> {
        if key_ids.is_empty() {
            return Err(TinkerError::NoUsableKey);
        }

        let peer = PublicKey::from(handshake.ephemeral);
        let mut combined = Vec::with_capacity(32 * key_ids.len());
        let mut server_publics = Vec::with_capacity(key_ids.len());

        for id in key_ids {
            let key = keys.get(*id).ok_or(TinkerError::UnknownKey(*id))?;
            let shared = key.secret().diffie_hellman(&peer);
            if !shared.was_contributory() {
                return Err(TinkerError::MalformedHandshake(
                    "non-contributory key agreement".into(),
                ));
            }
            combined.extend_from_slice(shared.as_bytes());
            server_publics.push(key.public().key);
        }

        let (to_responder, to_initiator) = derive_keys(
            &combined,
            &handshake.salt,
            &handshake.ephemeral,
            &server_publics,
        )?;

        Ok(Session {
            suite,
            sealer: Sealer::new(&to_initiator),
            opener: Opener::new(&to_responder),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ExchangeKey;
    use chrono::Duration;

    fn ring_with_keys(ids: &[u32]) -> KeyRing {
        let ring = KeyRing::new();
        for id in ids {
            ring.insert(ExchangeKey::generate(*id, Duration::hours(1)));
        }
        ring
    }

    fn publics(ring: &KeyRing, ids: &[u32]) -> Vec<PublicExchangeKey> {
        ids.iter()
            .map(|id| ring.get(*id).expect("key").public())
            .collect()
    }

    #[test]
    fn test_both_directions_agree() {
        let ring = ring_with_keys(&[1, 2]);
        let (mut client, handshake) =
            Session::initiate(ToolSuite::default(), &publics(&ring, &[1, 2])).unwrap();

        let wire = handshake.encode();
        let decoded = Handshake::decode(&wire).unwrap();
        let mut server =
            Session::respond(ToolSuite::default(), &[1, 2], &decoded, &ring).unwrap();

        for i in 0..3u8 {
            let sealed = client.sealer.seal(&[i; 10]).unwrap();
            assert_eq!(sealed.len(), 10 + TAG_LEN);
            assert_eq!(server.opener.open(&sealed).unwrap(), vec![i; 10]);
        }

        let reply = server.sealer.seal(b"pong").unwrap();
        assert_eq!(client.opener.open(&reply).unwrap(), b"pong");
    }

    #[test]
    fn test_respond_with_missing_key() {
        let ring = ring_with_keys(&[1]);
        let (_, handshake) = Session::initiate(ToolSuite::default(), &publics(&ring, &[1])).unwrap();

        let result = Session::respond(ToolSuite::default(), &[1, 7], &handshake, &ring);
        assert!(matches!(result, Err(TinkerError::UnknownKey(7))));
    }

    #[test]
    fn test_initiate_without_keys() {
        let result = Session::initiate(ToolSuite::default(), &[]);
        assert!(matches!(result, Err(TinkerError::NoUsableKey)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let ring = ring_with_keys(&[3]);
        let (mut client, handshake) =
            Session::initiate(ToolSuite::default(), &publics(&ring, &[3])).unwrap();
        let mut server = Session::respond(ToolSuite::default(), &[3], &handshake, &ring).unwrap();

        let mut sealed = client.sealer.seal(b"hello").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(server.opener.open(&sealed), Err(TinkerError::Decrypt)));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let ring = ring_with_keys(&[3]);
        let (mut client, handshake) =
            Session::initiate(ToolSuite::default(), &publics(&ring, &[3])).unwrap();
        let mut server = Session::respond(ToolSuite::default(), &[3], &handshake, &ring).unwrap();

        let _first = client.sealer.seal(b"one").unwrap();
        let second = client.sealer.seal(b"two").unwrap();
        assert!(server.opener.open(&second).is_err());
    }

    #[test]
    fn test_handshake_length_checked() {
        assert!(matches!(
            Handshake::decode(&[0u8; 10]),
            Err(TinkerError::MalformedHandshake(_))
        ));
    }
}
