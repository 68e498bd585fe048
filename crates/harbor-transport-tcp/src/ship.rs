//! TCP stream ship

use async_trait::async_trait;
use harbor_transport::{Ship, ShipError, ShipResult};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Ship over a TCP stream
#[derive(Debug)]
pub struct TcpShip {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    mine: bool,
    sunk: CancellationToken,
    max_transient_retries: usize,
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

impl TcpShip {
    pub fn new(stream: TcpStream, mine: bool, max_transient_retries: usize) -> ShipResult<Self> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
            mine,
            sunk: CancellationToken::new(),
            max_transient_retries,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Sink the ship without waiting on a blocked writer. A `load` in
    /// progress notices the cancellation and shuts the stream down itself.
    async fn mark_sunk(&self) {
        if self.sunk.is_cancelled() {
            return;
        }
        self.sunk.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            shutdown_writer(&mut writer, self.remote).await;
        }
    }
}

async fn shutdown_writer(writer: &mut OwnedWriteHalf, remote: SocketAddr) {
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of {} failed: {}", remote, e);
    }
}

#[async_trait]
impl Ship for TcpShip {
    async fn load(&self, data: &[u8]) -> ShipResult<bool> {
        if self.is_sunk() {
            return Ok(false);
        }

        let mut writer = tokio::select! {
            _ = self.sunk.cancelled() => return Ok(false),
            writer = self.writer.lock() => writer,
        };
        let mut written = 0;
        let mut transient = 0;

        while written < data.len() {
            let result = tokio::select! {
                biased;
                _ = self.sunk.cancelled() => {
                    shutdown_writer(&mut writer, self.remote).await;
                    return Ok(false);
                }
                result = writer.write(&data[written..]) => result,
            };
            match result {
                Ok(0) => {
                    drop(writer);
                    self.mark_sunk().await;
                    return Err(ShipError::Io(ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    written += n;
                    transient = 0;
                }
                Err(e) if is_transient(e.kind()) => {
                    transient += 1;
                    if transient >= self.max_transient_retries {
                        warn!("Ship to {} failed after {} transient errors", self.remote, transient);
                        drop(writer);
                        self.mark_sunk().await;
                        return Err(ShipError::TransientExhausted(transient));
                    }
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    debug!("Write to {} failed: {}", self.remote, e);
                    drop(writer);
                    self.mark_sunk().await;
                    return Err(ShipError::Io(e));
                }
            }
        }

        Ok(true)
    }

    async fn unload_to(&self, buf: &mut [u8]) -> ShipResult<Option<usize>> {
        if self.is_sunk() {
            return Ok(None);
        }

        let mut reader = tokio::select! {
            _ = self.sunk.cancelled() => return Ok(None),
            reader = self.reader.lock() => reader,
        };
        let mut transient = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.sunk.cancelled() => return Ok(None),
                result = reader.read(buf) => result,
            };
            match result {
                Ok(0) => {
                    drop(reader);
                    debug!("Ship from {} closed by peer", self.remote);
                    self.mark_sunk().await;
                    return Ok(None);
                }
                Ok(n) => return Ok(Some(n)),
                Err(e) if is_transient(e.kind()) => {
                    transient += 1;
                    if transient >= self.max_transient_retries {
                        drop(reader);
                        self.mark_sunk().await;
                        return Err(ShipError::TransientExhausted(transient));
                    }
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    drop(reader);
                    // A local sink shuts the socket down underneath a pending read
                    if self.is_sunk() {
                        return Ok(None);
                    }
                    self.mark_sunk().await;
                    return Err(ShipError::Io(e));
                }
            }
        }
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    async fn sink(&self) {
        self.mark_sunk().await;
    }

    fn is_sunk(&self) -> bool {
        self.sunk.is_cancelled()
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }

    fn remote_address(&self) -> String {
        self.remote.to_string()
    }
}
