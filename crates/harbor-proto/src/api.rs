//! API frame types carried inside a line
//!
//! Every frame is `<varint: call_id> <u8: msg_type> <payload>`.

use crate::container::{Container, ContainerError};

/// API message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApiMsgType {
    /// Starts a new call; payload begins with the handler ID
    Call = 0,
    /// Positive acknowledgement; ends the call
    Ack = 1,
    Data = 2,
    /// Error report; the call stays open
    Err = 3,
    /// Silent end of call
    End = 4,
}

impl ApiMsgType {
    /// Whether receiving this message type finishes the call
    pub fn ends_call(self) -> bool {
        matches!(self, ApiMsgType::Ack | ApiMsgType::End)
    }
}

impl TryFrom<u8> for ApiMsgType {
    type Error = ContainerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ApiMsgType::Call),
            1 => Ok(ApiMsgType::Ack),
            2 => Ok(ApiMsgType::Data),
            3 => Ok(ApiMsgType::Err),
            4 => Ok(ApiMsgType::End),
            _ => Err(ContainerError::UnknownOpcode(value)),
        }
    }
}

/// One API frame
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFrame {
    pub call_id: u32,
    pub msg_type: ApiMsgType,
    pub payload: Container,
}

impl ApiFrame {
    pub fn new(call_id: u32, msg_type: ApiMsgType, payload: Container) -> Self {
        Self {
            call_id,
            msg_type,
            payload,
        }
    }

    pub fn encode(self) -> Container {
        let mut c = self.payload;
        c.prepend(vec![self.msg_type as u8]);
        c.prepend_number(self.call_id as u64);
        c
    }

    pub fn decode(mut c: Container) -> Result<Self, ContainerError> {
        let call_id = c.get_next_n32()?;
        let msg_type = ApiMsgType::try_from(c.get_u8()?)?;
        Ok(Self {
            call_id,
            msg_type,
            payload: c,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_frame_layout() {
        let frame = ApiFrame::new(300, ApiMsgType::Data, Container::from_bytes("hi"));
        let bytes = frame.encode().compile_data();
        assert_eq!(bytes.as_ref(), &[0xac, 0x02, 2, b'h', b'i']);
    }

    #[test]
    fn test_frame_decode() {
        let frame = ApiFrame::new(7, ApiMsgType::Err, Container::from_bytes("[temp] busy"));
        let mut decoded = ApiFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.call_id, 7);
        assert_eq!(decoded.msg_type, ApiMsgType::Err);
        assert_eq!(
            decoded.payload.compile_data(),
            Bytes::from_static(b"[temp] busy")
        );
    }

    #[test]
    fn test_unknown_type() {
        let c = Container::from_bytes(vec![1u8, 9]);
        assert_eq!(ApiFrame::decode(c), Err(ContainerError::UnknownOpcode(9)));
    }

    #[test]
    fn test_ends_call() {
        assert!(ApiMsgType::Ack.ends_call());
        assert!(ApiMsgType::End.ends_call());
        assert!(!ApiMsgType::Err.ends_call());
        assert!(!ApiMsgType::Data.ends_call());
    }
}
