//! In-memory ship used by tests and single-process relay setups

use crate::{Ship, ShipResult};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Depth of each direction's queue, in loaded chunks
const CHANNEL_DEPTH: usize = 256;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Direction {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Reader>,
}

#[derive(Debug)]
struct Reader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl Direction {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        Self {
            tx,
            rx: Mutex::new(Reader {
                rx,
                pending: Bytes::new(),
            }),
        }
    }
}

#[derive(Debug)]
struct Pipe {
    id: u64,
    /// Dialer to acceptor
    forward: Direction,
    /// Acceptor to dialer
    backward: Direction,
    sunk: CancellationToken,
}

/// One end of an in-memory byte pipe.
///
/// Both ends share the same pair of queues; [`reverse`](MemoryShip::reverse)
/// returns the view from the other end.
#[derive(Debug, Clone)]
pub struct MemoryShip {
    pipe: Arc<Pipe>,
    mine: bool,
}

impl MemoryShip {
    /// Create a connected pair: the dialer end and the accepting end
    pub fn pair() -> (MemoryShip, MemoryShip) {
        let ship = MemoryShip::new();
        let peer = ship.reverse();
        (ship, peer)
    }

    /// Create the dialer end of a new pipe
    pub fn new() -> Self {
        Self {
            pipe: Arc::new(Pipe {
                id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
                forward: Direction::new(),
                backward: Direction::new(),
                sunk: CancellationToken::new(),
            }),
            mine: true,
        }
    }

    /// The same pipe seen from the other end
    pub fn reverse(&self) -> Self {
        Self {
            pipe: self.pipe.clone(),
            mine: !self.mine,
        }
    }

    fn outgoing(&self) -> &Direction {
        if self.mine {
            &self.pipe.forward
        } else {
            &self.pipe.backward
        }
    }

    fn incoming(&self) -> &Direction {
        if self.mine {
            &self.pipe.backward
        } else {
            &self.pipe.forward
        }
    }
}

impl Default for MemoryShip {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ship for MemoryShip {
    async fn load(&self, data: &[u8]) -> ShipResult<bool> {
        if self.is_sunk() {
            return Ok(false);
        }
        if data.is_empty() {
            return Ok(true);
        }

        let chunk = Bytes::copy_from_slice(data);
        tokio::select! {
            _ = self.pipe.sunk.cancelled() => Ok(false),
            sent = self.outgoing().tx.send(chunk) => Ok(sent.is_ok()),
        }
    }

    async fn unload_to(&self, buf: &mut [u8]) -> ShipResult<Option<usize>> {
        if buf.is_empty() {
            return Ok(Some(0));
        }

        let mut reader = self.incoming().rx.lock().await;

        if reader.pending.is_empty() {
            let next = tokio::select! {
                biased;
                chunk = reader.rx.recv() => chunk,
                _ = self.pipe.sunk.cancelled() => None,
            };
            match next {
                Some(chunk) => reader.pending = chunk,
                None => return Ok(None),
            }
        }

        let n = reader.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        Ok(Some(n))
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    async fn sink(&self) {
        self.pipe.sunk.cancel();
    }

    fn is_sunk(&self) -> bool {
        self.pipe.sunk.is_cancelled()
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }

    fn remote_address(&self) -> String {
        let side = if self.mine { "acceptor" } else { "dialer" };
        format!("memory:{}/{}", self.pipe.id, side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, b) = MemoryShip::pair();
        assert!(a.is_mine());
        assert!(!b.is_mine());

        assert!(a.load(b"hello").await.unwrap());
        assert!(b.load(b"world").await.unwrap());

        let mut buf = [0u8; 16];
        let n = b.unload_to(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = a.unload_to(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_partial_reads_keep_order() {
        let (a, b) = MemoryShip::pair();
        a.load(b"abcdef").await.unwrap();
        a.load(b"gh").await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while out.len() < 8 {
            let n = b.unload_to(&mut buf).await.unwrap().unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_reverse_shares_pipe() {
        let a = MemoryShip::new();
        let b = a.reverse();
        a.load(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.unload_to(&mut buf).await.unwrap(), Some(1));
        assert!(b.reverse().is_mine());
    }

    #[tokio::test]
    async fn test_sink_is_idempotent_and_visible_to_peer() {
        let (a, b) = MemoryShip::pair();
        a.sink().await;
        a.sink().await;

        assert!(a.is_sunk());
        assert!(b.is_sunk());
        assert!(!a.load(b"late").await.unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(b.unload_to(&mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sink_wakes_blocked_reader() {
        let (a, b) = MemoryShip::pair();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            b.unload_to(&mut buf).await.unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        a.sink().await;
        assert_eq!(reader.await.unwrap(), None);
    }
}
