//! Prepend-capable byte container
//!
//! A [`Container`] is the unit passed across every channel of the data-plane.
//! It stores its data as a queue of [`Bytes`] segments so that headers can be
//! pushed onto the front without copying the payload, and so that reads from
//! the front are cheap. [`Container::compile_data`] collapses the segments into
//! one contiguous buffer when a flat view is needed.

use crate::varint::{self, VarintError, MAX_LEN_16, MAX_LEN_32, MAX_LEN_64, MAX_LEN_8};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Container and framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("Not enough data: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed varint")]
    MalformedVarint,

    #[error("Length {length} exceeds limit of {limit}")]
    TooLarge { length: usize, limit: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),
}

impl ContainerError {
    fn from_varint(err: VarintError, available: usize) -> Self {
        match err {
            VarintError::Truncated => ContainerError::Truncated {
                needed: available + 1,
                available,
            },
            VarintError::Malformed => ContainerError::MalformedVarint,
        }
    }
}

/// Prepend-capable byte buffer
#[derive(Clone, Default)]
pub struct Container {
    parts: VecDeque<Bytes>,
    len: usize,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container holding `data`
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let mut c = Self::new();
        c.append(data);
        c
    }

    /// Total number of bytes held
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append data to the back
    pub fn append(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.parts.push_back(data);
    }

    /// Prepend data to the front
    pub fn prepend(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.parts.push_front(data);
    }

    /// Move all data of `other` to the back of this container
    pub fn append_container(&mut self, other: Container) {
        self.len += other.len;
        self.parts.extend(other.parts);
    }

    /// Append a varint-encoded number
    pub fn append_number(&mut self, value: u64) {
        self.append(varint::encode(value));
    }

    /// Prepend a varint-encoded number
    pub fn prepend_number(&mut self, value: u64) {
        self.prepend(varint::encode(value));
    }

    /// Prepend the current length of the container as a varint
    pub fn prepend_length(&mut self) {
        self.prepend_number(self.len as u64);
    }

    /// Append `data` preceded by its length as a varint
    pub fn append_as_block(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        self.append_number(data.len() as u64);
        self.append(data);
    }

    /// Materialize the contents as one contiguous buffer.
    ///
    /// The container keeps its data, now stored as a single segment.
    pub fn compile_data(&mut self) -> Bytes {
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len);
                for part in self.parts.drain(..) {
                    buf.extend_from_slice(&part);
                }
                let data = buf.freeze();
                self.parts.push_back(data.clone());
                data
            }
        }
    }

    /// Consume the container and return its contents
    pub fn into_bytes(mut self) -> Bytes {
        self.compile_data()
    }

    /// Copy up to `out.len()` bytes from the front without consuming them
    pub fn peek_into(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for part in &self.parts {
            if copied == out.len() {
                break;
            }
            let n = part.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&part[..n]);
            copied += n;
        }
        copied
    }

    /// Consume and return the next `n` bytes
    pub fn get(&mut self, n: usize) -> Result<Bytes, ContainerError> {
        if n > self.len {
            return Err(ContainerError::Truncated {
                needed: n,
                available: self.len,
            });
        }
        if n == 0 {
            return Ok(Bytes::new());
        }

        self.len -= n;

        if let Some(front) = self.parts.front_mut() {
            if front.len() > n {
                return Ok(front.split_to(n));
            }
            if front.len() == n {
                return Ok(self.parts.pop_front().unwrap_or_default());
            }
        }

        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            let Some(mut part) = self.parts.pop_front() else {
                break;
            };
            let wanted = n - buf.len();
            if part.len() > wanted {
                buf.extend_from_slice(&part.split_to(wanted));
                self.parts.push_front(part);
            } else {
                buf.extend_from_slice(&part);
            }
        }
        Ok(buf.freeze())
    }

    /// Consume and return everything left
    pub fn get_all(&mut self) -> Bytes {
        let data = self.compile_data();
        self.parts.clear();
        self.len = 0;
        data
    }

    /// Discard the next `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<(), ContainerError> {
        self.get(n).map(|_| ())
    }

    fn get_varint<T>(
        &mut self,
        max_len: usize,
        decode: fn(&[u8]) -> Result<(T, usize), VarintError>,
    ) -> Result<T, ContainerError> {
        let mut head = [0u8; MAX_LEN_64];
        let available = self.peek_into(&mut head[..max_len]);
        let (value, n) =
            decode(&head[..available]).map_err(|e| ContainerError::from_varint(e, self.len))?;
        self.skip(n)?;
        Ok(value)
    }

    /// Consume an 8-bit varint from the front
    pub fn get_next_n8(&mut self) -> Result<u8, ContainerError> {
        self.get_varint(MAX_LEN_8, varint::decode_u8)
    }

    /// Consume a 16-bit varint from the front
    pub fn get_next_n16(&mut self) -> Result<u16, ContainerError> {
        self.get_varint(MAX_LEN_16, varint::decode_u16)
    }

    /// Consume a 32-bit varint from the front
    pub fn get_next_n32(&mut self) -> Result<u32, ContainerError> {
        self.get_varint(MAX_LEN_32, varint::decode_u32)
    }

    /// Consume a 64-bit varint from the front
    pub fn get_next_n64(&mut self) -> Result<u64, ContainerError> {
        self.get_varint(MAX_LEN_64, varint::decode_u64)
    }

    /// Consume one raw byte from the front
    pub fn get_u8(&mut self) -> Result<u8, ContainerError> {
        let data = self.get(1)?;
        Ok(data[0])
    }

    /// Consume a varint length followed by that many bytes
    pub fn get_next_block(&mut self) -> Result<Bytes, ContainerError> {
        let length = self.get_next_n32()? as usize;
        self.get(length)
    }

    /// Like [`get_next_block`](Self::get_next_block), rejecting blocks above `limit`
    pub fn get_next_block_limited(&mut self, limit: usize) -> Result<Bytes, ContainerError> {
        let length = self.get_next_n32()? as usize;
        if length > limit {
            return Err(ContainerError::TooLarge { length, limit });
        }
        self.get(length)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("len", &self.len)
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        self.clone().compile_data() == other.clone().compile_data()
    }
}

impl From<Bytes> for Container {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for Container {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static [u8]> for Container {
    fn from(data: &'static [u8]) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static str> for Container {
    fn from(data: &'static str) -> Self {
        Self::from_bytes(data)
    }
}
