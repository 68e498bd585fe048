//! TCP ship listener and connector

use crate::config::TcpShipConfig;
use crate::ship::TcpShip;
use harbor_proto::{varint, PROTOCOL_VERSION};
use harbor_transport::{ShipError, ShipResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Number of bytes inspected to classify a new connection
const SNIFF_LEN: usize = 8;

/// Classified ships waiting for `accept`
const ACCEPT_BACKLOG: usize = 64;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"HEAD ", b"POST ", b"PUT ", b"DELETE ", b"OPTIONS ", b"CONNECT ", b"PATCH ",
];

/// What the first bytes of an incoming connection look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstContact {
    /// A framed crane initializer
    Crane,
    /// A plain HTTP request
    Http,
    /// Too little data to decide yet
    Undecided,
    /// Anything else
    Unknown,
}

/// Classify the first bytes received on an incoming connection
pub fn classify_first_bytes(data: &[u8]) -> FirstContact {
    if HTTP_METHODS.iter().any(|m| data.starts_with(m)) {
        return FirstContact::Http;
    }
    if HTTP_METHODS
        .iter()
        .any(|m| !data.is_empty() && m.starts_with(data))
    {
        return FirstContact::Undecided;
    }

    match varint::decode_u32(data) {
        Ok((length, n)) => match data.get(n) {
            Some(&version) if version == PROTOCOL_VERSION && length > 1 => FirstContact::Crane,
            Some(_) => FirstContact::Unknown,
            None => FirstContact::Undecided,
        },
        Err(varint::VarintError::Truncated) => FirstContact::Undecided,
        Err(varint::VarintError::Malformed) => FirstContact::Unknown,
    }
}

fn info_page(config: &TcpShipConfig) -> String {
    let body = format!(
        "{}\r\n\r\nThis is a relay of an overlay network. It speaks no HTTP.\r\n",
        config.info_name
    );
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Accepts incoming TCP ships
///
/// Each new connection is classified on its own task, so silent clients cannot
/// hold up the accept loop.
#[derive(Debug)]
pub struct TcpShipListener {
    local_addr: SocketAddr,
    ships: Mutex<mpsc::Receiver<(TcpShip, SocketAddr)>>,
    accept_task: JoinHandle<()>,
}

impl TcpShipListener {
    pub async fn bind(addr: SocketAddr, config: Arc<TcpShipConfig>) -> ShipResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ShipError::Connection(format!("Failed to bind to {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        info!("TCP ship listener on {}", local_addr);

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(listener, config, tx));

        Ok(Self {
            local_addr,
            ships: Mutex::new(rx),
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection that speaks the crane protocol.
    ///
    /// Connections that stay silent past the first-read deadline, or that send
    /// something else, are answered in the background and never returned.
    pub async fn accept(&self) -> ShipResult<(TcpShip, SocketAddr)> {
        self.ships
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ShipError::Connection("listener closed".to_string()))
    }
}

impl Drop for TcpShipListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<TcpShipConfig>,
    ships: mpsc::Sender<(TcpShip, SocketAddr)>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        trace!("Accepted TCP connection from {}", peer);

        let config = config.clone();
        let ships = ships.clone();
        tokio::spawn(async move {
            match sniff(&stream, config.first_read_timeout).await {
                FirstContact::Crane => {
                    debug!("Incoming ship from {}", peer);
                    match TcpShip::new(stream, false, config.max_transient_retries) {
                        Ok(ship) => {
                            let _ = ships.send((ship, peer)).await;
                        }
                        Err(e) => debug!("Dropping ship from {}: {}", peer, e),
                    }
                }
                FirstContact::Http => {
                    debug!("Serving info page to {}", peer);
                    respond_and_close(stream, info_page(&config).into_bytes()).await;
                }
                FirstContact::Undecided | FirstContact::Unknown => {
                    debug!("Serving banner to {}", peer);
                    respond_and_close(stream, config.banner.clone().into_bytes()).await;
                }
            }
        });
    }
}

async fn sniff(stream: &TcpStream, deadline: Duration) -> FirstContact {
    let until = Instant::now() + deadline;
    let mut buf = [0u8; SNIFF_LEN];

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        let n = match timeout(remaining, stream.peek(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return FirstContact::Unknown,
            Ok(Ok(n)) => n,
        };

        match classify_first_bytes(&buf[..n]) {
            FirstContact::Undecided if n < SNIFF_LEN => {
                // peek returns immediately while data is buffered; wait for more
                tokio::time::sleep(Duration::from_millis(5)).await;
                if Instant::now() >= until {
                    return FirstContact::Unknown;
                }
            }
            FirstContact::Undecided => return FirstContact::Unknown,
            decided => return decided,
        }
    }
}

async fn respond_and_close(mut stream: TcpStream, response: Vec<u8>) {
    if let Err(e) = stream.write_all(&response).await {
        trace!("Failed to write response: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// Dials outgoing TCP ships
#[derive(Debug, Clone)]
pub struct TcpShipConnector {
    config: Arc<TcpShipConfig>,
}

impl TcpShipConnector {
    pub fn new(config: Arc<TcpShipConfig>) -> Self {
        Self { config }
    }

    pub async fn connect(&self, addr: SocketAddr) -> ShipResult<TcpShip> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShipError::Timeout)?
            .map_err(|e| ShipError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        debug!("Dialed ship to {}", addr);
        TcpShip::new(stream, true, self.config.max_transient_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_crane() {
        assert_eq!(classify_first_bytes(&[20, PROTOCOL_VERSION, 1]), FirstContact::Crane);
        assert_eq!(
            classify_first_bytes(&[0x81, 0x01, PROTOCOL_VERSION]),
            FirstContact::Crane
        );
    }

    #[test]
    fn test_classify_http() {
        assert_eq!(classify_first_bytes(b"GET / HTTP/1.1"), FirstContact::Http);
        assert_eq!(classify_first_bytes(b"GE"), FirstContact::Undecided);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify_first_bytes(&[20, 99]), FirstContact::Unknown);
        assert_eq!(classify_first_bytes(&[0xff; 8]), FirstContact::Unknown);
        assert_eq!(classify_first_bytes(&[20]), FirstContact::Undecided);
    }

    #[test]
    fn test_info_page_has_length() {
        let page = info_page(&TcpShipConfig::default().with_info_name("Port2"));
        assert!(page.starts_with("HTTP/1.1 200 OK"));
        assert!(page.contains("Port2"));
    }
}
