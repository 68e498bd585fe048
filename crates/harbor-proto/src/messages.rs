//! Crane initializer and controller message types

use crate::container::{Container, ContainerError};
use bytes::Bytes;

/// Maximum length of a relay name inside an [`Initializer`]
pub const MAX_RELAY_NAME_LEN: usize = 255;

/// Maximum number of exchange key IDs requested in one [`Initializer`]
pub const MAX_KEY_IDS: usize = 16;

/// Maximum size of the handshake block following the initializer fields
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// Session setup request.
///
/// Sent unencrypted at the start of a ship by the dialing side, and embedded in
/// controller line requests to set up end-to-end line encryption.
///
/// Wire layout:
///
/// ```text
/// <u8: version> <varint: tool_suite> <varint: name_len><name>
/// <varint: n_key_ids><varint x n> <varint: handshake_len><handshake>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initializer {
    pub version: u8,
    pub tool_suite: u16,
    pub dest_relay: String,
    pub key_ids: Vec<u32>,
    /// Opaque key exchange material produced by the selected tool suite
    pub handshake: Bytes,
}

impl Initializer {
    pub fn encode(&self) -> Container {
        let mut c = Container::new();
        c.append(vec![self.version]);
        c.append_number(self.tool_suite as u64);
        c.append_as_block(Bytes::copy_from_slice(self.dest_relay.as_bytes()));
        c.append_number(self.key_ids.len() as u64);
        for id in &self.key_ids {
            c.append_number(*id as u64);
        }
        c.append_as_block(self.handshake.clone());
        c
    }

    pub fn decode(c: &mut Container) -> Result<Self, ContainerError> {
        let version = c.get_u8()?;
        let tool_suite = c.get_next_n16()?;
        let name = c.get_next_block_limited(MAX_RELAY_NAME_LEN)?;
        let dest_relay = String::from_utf8(name.to_vec())
            .map_err(|_| ContainerError::InvalidMessage("relay name is not utf-8".into()))?;

        let count = c.get_next_n8()? as usize;
        if count > MAX_KEY_IDS {
            return Err(ContainerError::TooLarge {
                length: count,
                limit: MAX_KEY_IDS,
            });
        }
        let mut key_ids = Vec::with_capacity(count);
        for _ in 0..count {
            key_ids.push(c.get_next_n32()?);
        }

        let handshake = c.get_next_block_limited(MAX_HANDSHAKE_LEN)?;

        Ok(Self {
            version,
            tool_suite,
            dest_relay,
            key_ids,
            handshake,
        })
    }

    /// Encode with an outer varint length, ready to be written to a ship
    pub fn to_frame(&self) -> Bytes {
        let mut c = self.encode();
        c.prepend_length();
        c.compile_data()
    }
}

/// Reach of an identity announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnouncementScope {
    Local = 1,
    Global = 2,
}

impl TryFrom<u8> for AnnouncementScope {
    type Error = ContainerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AnnouncementScope::Local),
            2 => Ok(AnnouncementScope::Global),
            _ => Err(ContainerError::InvalidMessage(format!(
                "unknown announcement scope {}",
                value
            ))),
        }
    }
}

/// Opcodes of the in-band controller protocol (line ID 0)
pub mod opcode {
    pub const NEW_LINE_REQUEST: u8 = 1;
    pub const NEW_LINE_RESPONSE: u8 = 2;
    pub const NEW_LINE_REJECTED: u8 = 3;
    pub const LINE_DISCARD: u8 = 4;
    pub const LINE_SPACE: u8 = 5;
    pub const BOTTLE_UPDATE: u8 = 6;
    pub const PUBLISH: u8 = 7;
    pub const PUBLISH_ACK: u8 = 8;
}

/// Crane controller messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerMsg {
    /// Ask the peer to set up a new line
    NewLineRequest {
        request_id: u32,
        shore_cap: u32,
        init: Option<Initializer>,
    },
    /// The peer built the line and assigned it `line_id`
    NewLineResponse {
        request_id: u32,
        line_id: u32,
        shore_cap: u32,
    },
    NewLineRejected {
        request_id: u32,
        reason: String,
    },
    /// Tear down a line
    LineDiscard { line_id: u32 },
    /// Flow control credit for a line
    LineSpace { line_id: u32, delta: u32 },
    /// Identity announcement forwarded between relays
    BottleUpdate {
        scope: AnnouncementScope,
        data: Bytes,
    },
    /// Request to publish the sender's identity through this crane
    Publish { data: Bytes },
    PublishAck { accepted: bool },
}

impl ControllerMsg {
    pub fn opcode(&self) -> u8 {
        match self {
            ControllerMsg::NewLineRequest { .. } => opcode::NEW_LINE_REQUEST,
            ControllerMsg::NewLineResponse { .. } => opcode::NEW_LINE_RESPONSE,
            ControllerMsg::NewLineRejected { .. } => opcode::NEW_LINE_REJECTED,
            ControllerMsg::LineDiscard { .. } => opcode::LINE_DISCARD,
            ControllerMsg::LineSpace { .. } => opcode::LINE_SPACE,
            ControllerMsg::BottleUpdate { .. } => opcode::BOTTLE_UPDATE,
            ControllerMsg::Publish { .. } => opcode::PUBLISH,
            ControllerMsg::PublishAck { .. } => opcode::PUBLISH_ACK,
        }
    }

    pub fn encode(&self) -> Container {
        let mut c = Container::new();
        c.append(vec![self.opcode()]);

        match self {
            ControllerMsg::NewLineRequest {
                request_id,
                shore_cap,
                init,
            } => {
                c.append_number(*request_id as u64);
                c.append_number(*shore_cap as u64);
                match init {
                    Some(init) => {
                        c.append(vec![1]);
                        c.append_container(init.encode());
                    }
                    None => c.append(vec![0]),
                }
            }
            ControllerMsg::NewLineResponse {
                request_id,
                line_id,
                shore_cap,
            } => {
                c.append_number(*request_id as u64);
                c.append_number(*line_id as u64);
                c.append_number(*shore_cap as u64);
            }
            ControllerMsg::NewLineRejected { request_id, reason } => {
                c.append_number(*request_id as u64);
                c.append_as_block(Bytes::copy_from_slice(reason.as_bytes()));
            }
            ControllerMsg::LineDiscard { line_id } => {
                c.append_number(*line_id as u64);
            }
            ControllerMsg::LineSpace { line_id, delta } => {
                c.append_number(*line_id as u64);
                c.append_number(*delta as u64);
            }
            ControllerMsg::BottleUpdate { scope, data } => {
                c.append(vec![*scope as u8]);
                c.append(data.clone());
            }
            ControllerMsg::Publish { data } => {
                c.append(data.clone());
            }
            ControllerMsg::PublishAck { accepted } => {
                c.append(vec![u8::from(*accepted)]);
            }
        }

        c
    }

    pub fn decode(mut c: Container) -> Result<Self, ContainerError> {
        let op = c.get_u8()?;

        let msg = match op {
            opcode::NEW_LINE_REQUEST => {
                let request_id = c.get_next_n32()?;
                let shore_cap = c.get_next_n32()?;
                let init = match c.get_u8()? {
                    0 => None,
                    _ => Some(Initializer::decode(&mut c)?),
                };
                ControllerMsg::NewLineRequest {
                    request_id,
                    shore_cap,
                    init,
                }
            }
            opcode::NEW_LINE_RESPONSE => ControllerMsg::NewLineResponse {
                request_id: c.get_next_n32()?,
                line_id: c.get_next_n32()?,
                shore_cap: c.get_next_n32()?,
            },
            opcode::NEW_LINE_REJECTED => {
                let request_id = c.get_next_n32()?;
                let reason = c.get_next_block()?;
                ControllerMsg::NewLineRejected {
                    request_id,
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                }
            }
            opcode::LINE_DISCARD => ControllerMsg::LineDiscard {
                line_id: c.get_next_n32()?,
            },
            opcode::LINE_SPACE => ControllerMsg::LineSpace {
                line_id: c.get_next_n32()?,
                delta: c.get_next_n32()?,
            },
            opcode::BOTTLE_UPDATE => {
                let scope = AnnouncementScope::try_from(c.get_u8()?)?;
                ControllerMsg::BottleUpdate {
                    scope,
                    data: c.get_all(),
                }
            }
            opcode::PUBLISH => ControllerMsg::Publish { data: c.get_all() },
            opcode::PUBLISH_ACK => ControllerMsg::PublishAck {
                accepted: c.get_u8()? != 0,
            },
            other => return Err(ContainerError::UnknownOpcode(other)),
        };

        Ok(msg)
    }
}
