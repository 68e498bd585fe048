//! Integration tests for the TCP ship listener and connector

use harbor_proto::PROTOCOL_VERSION;
use harbor_transport::Ship;
use harbor_transport_tcp::{TcpShip, TcpShipConfig, TcpShipConnector, TcpShipListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn test_config() -> Arc<TcpShipConfig> {
    Arc::new(
        TcpShipConfig::default()
            .with_first_read_timeout(Duration::from_millis(200))
            .with_info_name("Port2")
            .with_banner("quote of the day\r\n"),
    )
}

#[tokio::test]
async fn test_crane_connection_is_accepted() {
    init_logging();
    let listener = TcpShipListener::bind("127.0.0.1:0".parse().unwrap(), test_config())
        .await
        .unwrap();
    let addr = listener.local_addr();

    let connector = TcpShipConnector::new(test_config());
    let client = connector.connect(addr).await.unwrap();
    assert!(client.is_mine());

    // A framed initializer prefix: length, then version
    let frame = [4u8, PROTOCOL_VERSION, 1, 0, 0];
    assert!(client.load(&frame).await.unwrap());

    let (server, _peer) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    assert!(!server.is_mine());

    // The sniffed bytes are still readable
    let mut buf = [0u8; 16];
    let mut read = Vec::new();
    while read.len() < frame.len() {
        let n = server.unload_to(&mut buf).await.unwrap().unwrap();
        read.extend_from_slice(&buf[..n]);
    }
    assert_eq!(read, frame);

    server.sink().await;
    server.sink().await;
    assert!(server.is_sunk());
    assert_eq!(
        timeout(Duration::from_secs(5), client.unload_to(&mut buf))
            .await
            .unwrap()
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_silent_client_gets_banner() {
    init_logging();
    let listener = TcpShipListener::bind("127.0.0.1:0".parse().unwrap(), test_config())
        .await
        .unwrap();
    let addr = listener.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, "quote of the day\r\n");
}

#[tokio::test]
async fn test_http_probe_gets_info_page() {
    init_logging();
    let listener = TcpShipListener::bind("127.0.0.1:0".parse().unwrap(), test_config())
        .await
        .unwrap();
    let addr = listener.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Port2"));
}

#[tokio::test]
async fn test_sink_returns_while_peer_stops_reading() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    // held open but never read, so the socket buffers fill up
    let (_peer, _) = listener.accept().await.unwrap();

    let ship = Arc::new(TcpShip::new(stream, true, 1000).unwrap());
    let loader = {
        let ship = ship.clone();
        tokio::spawn(async move {
            let chunk = [0u8; 4096];
            loop {
                match ship.load(&chunk).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => break,
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!loader.is_finished(), "writer should be blocked on a full socket");

    timeout(Duration::from_secs(3), ship.sink())
        .await
        .expect("sink returned");
    assert!(ship.is_sunk());
    timeout(Duration::from_secs(3), loader)
        .await
        .expect("blocked load gave up")
        .unwrap();
    assert!(!ship.load(b"late").await.unwrap());
}
