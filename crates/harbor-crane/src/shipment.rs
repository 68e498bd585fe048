//! Shipment packing and unpacking
//!
//! Outbound containers are packed back to back into fixed-size shipments:
//!
//! ```text
//! <2-byte varint: data_len> <data_len bytes of containers> <zero padding>
//! ```
//!
//! Each shipment is sealed and written to the ship as
//! `<varint: wire_len><ciphertext>`. Containers may span shipment boundaries;
//! the reader keeps a rolling accumulator to put them back together.

use crate::error::{CraneError, CraneResult};
use bytes::{Bytes, BytesMut};
use harbor_proto::varint::{self, VarintError, MAX_LEN_32};
use harbor_proto::{Container, SHIPMENT_PREFIX_SIZE};
use harbor_transport::Ship;
use std::sync::Arc;

/// Fills one shipment at a time
#[derive(Debug)]
pub struct ShipmentWriter {
    buf: Vec<u8>,
    data_len: usize,
}

impl ShipmentWriter {
    /// Create a writer for shipments of `size` bytes (prefix included)
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            data_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() - SHIPMENT_PREFIX_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    pub fn is_full(&self) -> bool {
        self.data_len == self.capacity()
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity() - self.data_len);
        let start = SHIPMENT_PREFIX_SIZE + self.data_len;
        self.buf[start..start + n].copy_from_slice(&data[..n]);
        self.data_len += n;
        n
    }

    /// Complete the current shipment and start a new one.
    ///
    /// The returned plaintext always has the full shipment size.
    pub fn finish(&mut self) -> CraneResult<Vec<u8>> {
        let prefix = u16::try_from(self.data_len)
            .ok()
            .and_then(varint::encode_fixed2)
            .ok_or_else(|| {
                CraneError::Framing(format!("shipment data too long: {}", self.data_len))
            })?;
        self.buf[..SHIPMENT_PREFIX_SIZE].copy_from_slice(&prefix);

        let size = self.buf.len();
        let shipment = std::mem::replace(&mut self.buf, vec![0u8; size]);
        self.data_len = 0;
        Ok(shipment)
    }
}

/// Reassembles containers from decrypted shipments
#[derive(Debug)]
pub struct ShipmentReader {
    accumulator: Container,
    pending: Option<usize>,
    max_data: usize,
    max_container: usize,
}

impl ShipmentReader {
    pub fn new(shipment_size: usize, max_container: usize) -> Self {
        Self {
            accumulator: Container::new(),
            pending: None,
            max_data: shipment_size - SHIPMENT_PREFIX_SIZE,
            max_container,
        }
    }

    /// Bytes received but not yet part of a complete container
    pub fn buffered(&self) -> usize {
        self.accumulator.len()
    }

    /// Take in one decrypted shipment and return every container it completes,
    /// together with the line it is addressed to.
    pub fn feed(&mut self, plaintext: &[u8]) -> CraneResult<Vec<(u32, Container)>> {
        let (data_len, n) = varint::decode_u16(plaintext)
            .map_err(|e| CraneError::Framing(format!("shipment length: {}", e)))?;
        let data_len = data_len as usize;
        if data_len > self.max_data || n + data_len > plaintext.len() {
            return Err(CraneError::Framing(format!(
                "shipment data length {} exceeds {}",
                data_len, self.max_data
            )));
        }
        if data_len > 0 {
            self.accumulator
                .append(Bytes::copy_from_slice(&plaintext[n..n + data_len]));
        }

        let mut complete = Vec::new();
        loop {
            let length = match self.pending {
                Some(length) => length,
                None => match self.next_length()? {
                    Some(length) => length,
                    None => break,
                },
            };

            if self.accumulator.len() < length {
                self.pending = Some(length);
                break;
            }
            self.pending = None;

            let mut container = Container::from_bytes(self.accumulator.get(length)?);
            let line_id = container.get_next_n32()?;
            complete.push((line_id, container));
        }

        Ok(complete)
    }

    fn next_length(&mut self) -> CraneResult<Option<usize>> {
        if self.accumulator.is_empty() {
            return Ok(None);
        }

        let mut head = [0u8; MAX_LEN_32];
        let available = self.accumulator.peek_into(&mut head);
        let (length, n) = match varint::decode_u32(&head[..available]) {
            Ok(decoded) => decoded,
            Err(VarintError::Truncated) if available < MAX_LEN_32 => return Ok(None),
            Err(e) => return Err(CraneError::Framing(format!("container length: {}", e))),
        };
        self.accumulator.skip(n)?;

        let length = length as usize;
        if length == 0 {
            return Err(CraneError::Framing("empty container".into()));
        }
        if length > self.max_container {
            return Err(CraneError::Framing(format!(
                "container length {} exceeds {}",
                length, self.max_container
            )));
        }
        Ok(Some(length))
    }
}

/// Reads `<varint: len><payload>` segments off a ship
pub(crate) struct WireReader {
    ship: Arc<dyn Ship>,
    buf: BytesMut,
    scratch: Vec<u8>,
}

impl WireReader {
    pub(crate) fn new(ship: Arc<dyn Ship>) -> Self {
        Self {
            ship,
            buf: BytesMut::with_capacity(16 * 1024),
            scratch: vec![0u8; 16 * 1024],
        }
    }

    /// Next complete segment, or `None` once the ship has sunk
    pub(crate) async fn next_segment(&mut self, limit: usize) -> CraneResult<Option<Bytes>> {
        loop {
            match varint::decode_u32(&self.buf) {
                Ok((length, n)) => {
                    let length = length as usize;
                    if length > limit {
                        return Err(CraneError::Framing(format!(
                            "wire segment length {} exceeds {}",
                            length, limit
                        )));
                    }
                    if self.buf.len() >= n + length {
                        let _ = self.buf.split_to(n);
                        return Ok(Some(self.buf.split_to(length).freeze()));
                    }
                }
                Err(VarintError::Truncated) => {}
                Err(VarintError::Malformed) => {
                    return Err(CraneError::Framing("malformed wire length".into()))
                }
            }

            match self.ship.unload_to(&mut self.scratch).await? {
                Some(n) => self.buf.extend_from_slice(&self.scratch[..n]),
                None => return Ok(None),
            }
        }
    }
}

/// Frame a sealed shipment for the wire
pub(crate) fn wire_segment(ciphertext: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ciphertext.len() + MAX_LEN_32);
    varint::put(&mut buf, ciphertext.len() as u64);
    buf.extend_from_slice(ciphertext);
    buf.freeze()
}
