//! Self-describing unsigned varints
//!
//! Values are encoded seven bits at a time, least significant group first. The
//! high bit of every byte marks a continuation, so the encoded length can be read
//! from the bytes themselves. Each integer width has a hard upper bound on the
//! number of bytes it may occupy; decoding rejects anything longer.

use bytes::BufMut;
use thiserror::Error;

/// Maximum encoded length of an 8-bit value
pub const MAX_LEN_8: usize = 2;
/// Maximum encoded length of a 16-bit value
pub const MAX_LEN_16: usize = 3;
/// Maximum encoded length of a 32-bit value
pub const MAX_LEN_32: usize = 5;
/// Maximum encoded length of a 64-bit value
pub const MAX_LEN_64: usize = 10;

/// Varint decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarintError {
    #[error("varint truncated")]
    Truncated,

    #[error("malformed varint")]
    Malformed,
}

/// Number of bytes `value` occupies when encoded
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Append the varint encoding of `value` to `buf`
pub fn put(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Encode `value` into a fresh buffer
pub fn encode(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    put(&mut out, value);
    out
}

/// Encode `value` in exactly two bytes.
///
/// Values below 128 use the non-minimal form `[0x80 | v, 0x00]`, which every
/// decoder in this crate accepts. Values that need more than 14 bits are rejected.
pub fn encode_fixed2(value: u16) -> Option<[u8; 2]> {
    if value >= 1 << 14 {
        return None;
    }
    Some([(value as u8 & 0x7f) | 0x80, (value >> 7) as u8])
}

fn decode_bounded(buf: &[u8], max_len: usize, max_value: u64) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= max_len {
            return Err(VarintError::Malformed);
        }
        let group = u64::from(byte & 0x7f);
        if i == MAX_LEN_64 - 1 && group > 1 {
            return Err(VarintError::Malformed);
        }
        value |= group << (7 * i);
        if byte < 0x80 {
            if value > max_value {
                return Err(VarintError::Malformed);
            }
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= max_len {
        Err(VarintError::Malformed)
    } else {
        Err(VarintError::Truncated)
    }
}

/// Decode an 8-bit varint, returning the value and bytes consumed
pub fn decode_u8(buf: &[u8]) -> Result<(u8, usize), VarintError> {
    decode_bounded(buf, MAX_LEN_8, u8::MAX as u64).map(|(v, n)| (v as u8, n))
}

/// Decode a 16-bit varint, returning the value and bytes consumed
pub fn decode_u16(buf: &[u8]) -> Result<(u16, usize), VarintError> {
    decode_bounded(buf, MAX_LEN_16, u16::MAX as u64).map(|(v, n)| (v as u16, n))
}

/// Decode a 32-bit varint, returning the value and bytes consumed
pub fn decode_u32(buf: &[u8]) -> Result<(u32, usize), VarintError> {
    decode_bounded(buf, MAX_LEN_32, u32::MAX as u64).map(|(v, n)| (v as u32, n))
}

/// Decode a 64-bit varint, returning the value and bytes consumed
pub fn decode_u64(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    decode_bounded(buf, MAX_LEN_64, u64::MAX)
}
