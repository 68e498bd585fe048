//! End-to-end line encryption

use crate::conveyor::Conveyor;
use crate::error::{CraneError, CraneResult};
use async_trait::async_trait;
use harbor_proto::{Container, Initializer, PROTOCOL_VERSION};
use harbor_tinker::{Handshake, KeyRing, Opener, PublicExchangeKey, Sealer, Session, ToolSuite};

/// Conveyor that decrypts inbound and encrypts outbound containers
#[derive(Debug)]
pub struct TinkerConveyor {
    sealer: Sealer,
    opener: Opener,
}

impl TinkerConveyor {
    pub fn new(session: Session) -> Self {
        Self {
            sealer: session.sealer,
            opener: session.opener,
        }
    }

    /// Start a session with the hub `dest_relay`, returning the conveyor and
    /// the initializer to send along with the line request
    pub fn initiate(
        dest_relay: impl Into<String>,
        server_keys: &[PublicExchangeKey],
    ) -> CraneResult<(Self, Initializer)> {
        let suite = ToolSuite::default();
        let (session, handshake) = Session::initiate(suite, server_keys)?;
        let init = Initializer {
            version: PROTOCOL_VERSION,
            tool_suite: suite.id(),
            dest_relay: dest_relay.into(),
            key_ids: server_keys.iter().map(|k| k.id).collect(),
            handshake: handshake.encode(),
        };
        Ok((Self::new(session), init))
    }

    /// Answer an initializer with the local exchange keys
    pub fn respond(init: &Initializer, keys: &KeyRing) -> CraneResult<Self> {
        if init.version != PROTOCOL_VERSION {
            return Err(CraneError::Protocol(format!(
                "unsupported protocol version {}",
                init.version
            )));
        }
        let suite = ToolSuite::try_from(init.tool_suite)?;
        let handshake = Handshake::decode(&init.handshake)?;
        let session = Session::respond(suite, &init.key_ids, &handshake, keys)?;
        Ok(Self::new(session))
    }
}

#[async_trait]
impl Conveyor for TinkerConveyor {
    fn name(&self) -> &'static str {
        "tinker"
    }

    async fn inbound(&mut self, mut c: Container) -> CraneResult<Container> {
        let plaintext = self.opener.open(&c.get_all())?;
        Ok(Container::from_bytes(plaintext))
    }

    async fn outbound(&mut self, mut c: Container) -> CraneResult<Container> {
        let ciphertext = self.sealer.seal(&c.get_all())?;
        Ok(Container::from_bytes(ciphertext))
    }
}
