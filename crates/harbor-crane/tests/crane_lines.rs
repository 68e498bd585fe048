//! End-to-end tests for cranes over in-memory ships

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use harbor_crane::{
    AnnouncementHandler, Conveyor, Crane, CraneConfig, CraneContext, CraneError, CraneResult,
    CraneSetup, CraneStatus, Docks, LineAcceptor, LineEnd, ShipmentWriter, StreamEvent,
};
use harbor_proto::{
    varint, AnnouncementScope, Container, ControllerMsg, Initializer, CONTROLLER_LINE_ID,
    PROTOCOL_VERSION, SHIPMENT_PREFIX_SIZE, SHIPMENT_SIZE,
};
use harbor_tinker::{Bottle, KeyRing, Sealer, Session, ToolSuite};
use harbor_transport::{MemoryShip, Ship};
use harbor_unit::Scheduler;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn relay_identity() -> (Bottle, KeyRing) {
    let ring = KeyRing::new();
    let public = ring.generate(ChronoDuration::hours(1));
    let bottle = Bottle::new("relay-b", "Relay B").with_exchange_keys(vec![public]);
    (bottle, ring)
}

async fn crane_pair(client: CraneContext, server: CraneContext) -> (Arc<Crane>, Arc<Crane>) {
    let (dialer, acceptor) = MemoryShip::pair();
    let (bottle, ring) = relay_identity();

    let server = tokio::spawn(Crane::start(
        Arc::new(acceptor),
        CraneSetup::Responder { keys: ring },
        server,
    ));
    let client = Crane::start(
        Arc::new(dialer),
        CraneSetup::Initiator { server: bottle },
        client,
    )
    .await
    .expect("client crane");
    let server = server.await.expect("join").expect("server crane");
    (client, server)
}

fn data(payload: &'static [u8]) -> Container {
    Container::from_bytes(Bytes::from_static(payload))
}

async fn expect_data(end: &mut LineEnd) -> Bytes {
    match timeout(Duration::from_secs(5), end.recv()).await {
        Ok(StreamEvent::Data(mut c)) => c.get_all(),
        Ok(other) => panic!("expected data, got {:?}", other),
        Err(_) => panic!("timed out waiting for data"),
    }
}

/// Sends every container straight back
struct EchoAcceptor;

impl LineAcceptor for EchoAcceptor {
    fn prepare(&self, _init: Option<&Initializer>) -> CraneResult<Vec<Box<dyn Conveyor>>> {
        Ok(Vec::new())
    }

    fn serve(&self, _crane: &Arc<Crane>, _line_id: u32, mut end: LineEnd) {
        tokio::spawn(async move {
            while let StreamEvent::Data(c) = end.recv().await {
                if end.send(c).await.is_err() {
                    return;
                }
            }
            end.close().await;
        });
    }
}

/// Hands accepted lines to the test
struct CollectingAcceptor {
    lines: mpsc::UnboundedSender<(u32, LineEnd)>,
}

impl LineAcceptor for CollectingAcceptor {
    fn prepare(&self, _init: Option<&Initializer>) -> CraneResult<Vec<Box<dyn Conveyor>>> {
        Ok(Vec::new())
    }

    fn serve(&self, _crane: &Arc<Crane>, line_id: u32, end: LineEnd) {
        let _ = self.lines.send((line_id, end));
    }
}

struct AcceptingAnnouncements {
    relay_id: Option<String>,
    updates: mpsc::UnboundedSender<(AnnouncementScope, Bytes)>,
}

#[async_trait]
impl AnnouncementHandler for AcceptingAnnouncements {
    async fn bottle_update(&self, _crane_id: &str, scope: AnnouncementScope, data: Bytes) {
        let _ = self.updates.send((scope, data));
    }

    async fn verify_publish(&self, _crane_id: &str, _data: Bytes) -> Option<String> {
        self.relay_id.clone()
    }
}

#[tokio::test]
async fn test_line_echo() {
    init_logging();
    let server_ctx = CraneContext::default().with_acceptor(Arc::new(EchoAcceptor));
    let (client, server) = crane_pair(CraneContext::default(), server_ctx).await;

    let (line_id, mut end) = client.establish_line(None, Vec::new()).await.unwrap();
    assert_eq!(line_id % 2, 1, "responder assigns odd line ids");
    assert!(client.line(line_id).is_some());
    assert!(server.line(line_id).is_some());

    end.send(data(b"hello")).await.unwrap();
    assert_eq!(expect_data(&mut end).await.as_ref(), b"hello");

    end.send(data(b"world")).await.unwrap();
    assert_eq!(expect_data(&mut end).await.as_ref(), b"world");
}

#[tokio::test]
async fn test_line_close_reaches_peer() {
    init_logging();
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    let server_ctx =
        CraneContext::default().with_acceptor(Arc::new(CollectingAcceptor { lines: lines_tx }));
    let (client, server) = crane_pair(CraneContext::default(), server_ctx).await;

    let (line_id, end) = client.establish_line(None, Vec::new()).await.unwrap();
    let (server_line_id, mut server_end) = lines_rx.recv().await.unwrap();
    assert_eq!(line_id, server_line_id);

    end.send(data(b"last words")).await.unwrap();
    end.close().await;

    assert_eq!(expect_data(&mut server_end).await.as_ref(), b"last words");
    assert_eq!(
        timeout(Duration::from_secs(5), server_end.recv()).await.unwrap(),
        StreamEvent::End
    );

    timeout(Duration::from_secs(5), async {
        while server.line(line_id).is_some() || client.line(line_id).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("line removed on both sides");
}

#[tokio::test]
async fn test_backpressure_bounds_sender_lead() {
    init_logging();
    const CAP: u32 = 100;
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    let config = CraneConfig::default().with_shore_cap(CAP);
    // credit plus what the two line ends and the two line tasks can hold
    let max_lead = CAP + 2 * config.link_depth as u32 + 2;
    let server_ctx = CraneContext::default()
        .with_config(config.clone())
        .with_acceptor(Arc::new(CollectingAcceptor { lines: lines_tx }));
    let client_ctx = CraneContext::default().with_config(config);
    let (client, server) = crane_pair(client_ctx, server_ctx).await;

    let (line_id, end) = client.establish_line(None, Vec::new()).await.unwrap();
    let (_, mut server_end) = lines_rx.recv().await.unwrap();
    let client_line = client.line(line_id).unwrap();
    let server_line = server.line(line_id).unwrap();

    let sent = Arc::new(AtomicU32::new(0));
    let writer = {
        let sent = sent.clone();
        tokio::spawn(async move {
            for i in 0u32..1000 {
                end.send(Container::from_bytes(i.to_be_bytes().to_vec()))
                    .await
                    .unwrap();
                sent.fetch_add(1, Ordering::SeqCst);
            }
            end
        })
    };

    // nobody reads yet: the sender stalls once the credit is spent
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled = sent.load(Ordering::SeqCst);
    assert!(stalled >= CAP, "sender stalled early at {}", stalled);
    assert!(stalled <= max_lead, "sender ran {} ahead", stalled);
    assert_eq!(client_line.ship_space(), 0);

    // slow consumer
    for i in 0u32..1000 {
        let got = expect_data(&mut server_end).await;
        assert_eq!(got.as_ref(), &i.to_be_bytes());

        let lead = sent.load(Ordering::SeqCst).saturating_sub(i + 1);
        assert!(lead <= max_lead, "sender ran {} ahead after {} reads", lead, i + 1);
        assert!(client_line.ship_space() >= 0);
        let flow = server_line.flow();
        assert!(flow.shore_space() >= 0);
        assert!(flow.reported() <= flow.shore_space());
        if i % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let _end = writer.await.unwrap();
    assert!(client.line(line_id).is_some(), "line must not be saturated");
    assert!(server.line(line_id).is_some());
    assert!(!client.is_stopped());
}

#[tokio::test]
async fn test_empty_containers_cost_no_credit() {
    init_logging();
    const CAP: u32 = 10;
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    let config = CraneConfig::default().with_shore_cap(CAP);
    let server_ctx = CraneContext::default()
        .with_config(config.clone())
        .with_acceptor(Arc::new(CollectingAcceptor { lines: lines_tx }));
    let client_ctx = CraneContext::default().with_config(config);
    let (client, _server) = crane_pair(client_ctx, server_ctx).await;

    let (line_id, end) = client.establish_line(None, Vec::new()).await.unwrap();
    let (_, mut server_end) = lines_rx.recv().await.unwrap();

    for _ in 0..3 * CAP {
        end.send(Container::new()).await.unwrap();
    }
    end.send(data(b"after the empties")).await.unwrap();

    assert_eq!(expect_data(&mut server_end).await.as_ref(), b"after the empties");
    let line = client.line(line_id).unwrap();
    timeout(Duration::from_secs(5), async {
        while line.ship_space() != (CAP - 1) as i64 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("only the real container took credit");
}

#[tokio::test]
async fn test_line_request_rejected_without_acceptor() {
    init_logging();
    let (client, _server) = crane_pair(CraneContext::default(), CraneContext::default()).await;

    let result = client.establish_line(None, Vec::new()).await;
    assert!(matches!(result, Err(CraneError::LineRejected(_))));
    assert_eq!(client.line_count(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_reaches_peer() {
    init_logging();
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    let server_ctx =
        CraneContext::default().with_acceptor(Arc::new(CollectingAcceptor { lines: lines_tx }));
    let (client, server) = crane_pair(CraneContext::default(), server_ctx).await;

    let (_, mut end) = client.establish_line(None, Vec::new()).await.unwrap();
    let (_, mut server_end) = lines_rx.recv().await.unwrap();

    client.stop("test").await;
    client.stop("test again").await;
    assert!(client.is_stopped());
    assert_eq!(client.status(), CraneStatus::Stopped);
    assert_eq!(client.line_count(), 0);
    assert!(client.ship().is_sunk());
    assert_eq!(end.recv().await, StreamEvent::End);

    timeout(Duration::from_secs(5), server.stopped())
        .await
        .expect("peer stops once the ship sinks");
    assert_eq!(server_end.recv().await, StreamEvent::End);

    assert!(matches!(
        client.establish_line(None, Vec::new()).await,
        Err(CraneError::Stopped)
    ));
}

#[tokio::test]
async fn test_stop_releases_only_own_scheduler() {
    init_logging();
    let shared = Scheduler::default();
    assert!(shared.start().is_some());
    let (client, server) = crane_pair(
        CraneContext::default(),
        CraneContext::default().with_scheduler(shared.clone()),
    )
    .await;
    assert!(!client.scheduler().is_released());

    client.stop("test").await;
    assert!(client.scheduler().is_released());

    timeout(Duration::from_secs(5), server.stopped())
        .await
        .expect("peer stops once the ship sinks");
    // the shared scheduler outlives the crane
    assert!(!shared.is_released());
    assert!(!server.scheduler().is_released());
    shared.release();
}

#[tokio::test]
async fn test_docks_follow_crane_lifecycle() {
    init_logging();
    let docks = Arc::new(Docks::new());
    let client_ctx = CraneContext::default().with_docks(docks.clone());
    let (client, _server) = crane_pair(client_ctx, CraneContext::default()).await;

    let docked = docks.get("relay-b").expect("crane docked under relay id");
    assert_eq!(docked.id(), client.id());
    assert_eq!(client.remote_relay().as_deref(), Some("relay-b"));

    client.stop("done").await;
    assert!(docks.get("relay-b").is_none());
    assert!(docks.is_empty());
}

#[tokio::test]
async fn test_publish_docks_peer() {
    init_logging();
    let docks = Arc::new(Docks::new());
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let server_ctx = CraneContext::default()
        .with_docks(docks.clone())
        .with_announcements(Arc::new(AcceptingAnnouncements {
            relay_id: Some("relay-a".into()),
            updates: updates_tx,
        }));
    let (client, server) = crane_pair(CraneContext::default(), server_ctx).await;

    assert!(client.publish(Bytes::from_static(b"bottle")).await.unwrap());
    assert_eq!(client.status(), CraneStatus::Published);
    assert_eq!(server.status(), CraneStatus::Published);
    assert_eq!(docks.get("relay-a").unwrap().id(), server.id());

    client.send_bottle_update(AnnouncementScope::Local, Bytes::from_static(b"local"));
    client.send_bottle_update(AnnouncementScope::Global, Bytes::from_static(b"global"));
    let (scope, data) = timeout(Duration::from_secs(5), updates_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scope, AnnouncementScope::Global);
    assert_eq!(data.as_ref(), b"global");
}

#[tokio::test]
async fn test_publish_refused() {
    init_logging();
    let (updates_tx, _updates_rx) = mpsc::unbounded_channel();
    let server_ctx = CraneContext::default().with_announcements(Arc::new(AcceptingAnnouncements {
        relay_id: None,
        updates: updates_tx,
    }));
    let (client, server) = crane_pair(CraneContext::default(), server_ctx).await;

    assert!(!client.publish(Bytes::from_static(b"bottle")).await.unwrap());
    assert_eq!(client.status(), CraneStatus::Private);
    assert_eq!(server.status(), CraneStatus::Private);
}

#[tokio::test]
async fn test_handshake_with_unknown_key_fails() {
    init_logging();
    let (dialer, acceptor) = MemoryShip::pair();
    let (bottle, _ring) = relay_identity();
    let acceptor = Arc::new(acceptor);

    let server = tokio::spawn(Crane::start(
        acceptor.clone(),
        CraneSetup::Responder {
            keys: KeyRing::new(),
        },
        CraneContext::default(),
    ));
    let _client = Crane::start(
        Arc::new(dialer),
        CraneSetup::Initiator { server: bottle },
        CraneContext::default(),
    )
    .await;

    assert!(matches!(
        server.await.unwrap(),
        Err(CraneError::Crypto(_))
    ));
    assert!(acceptor.is_sunk());
}

#[tokio::test]
async fn test_handshake_timeout() {
    init_logging();
    let (_dialer, acceptor) = MemoryShip::pair();
    let acceptor = Arc::new(acceptor);
    let config = CraneConfig::default().with_handshake_timeout(Duration::from_millis(50));

    let result = Crane::start(
        acceptor.clone(),
        CraneSetup::Responder {
            keys: KeyRing::new(),
        },
        CraneContext::default().with_config(config),
    )
    .await;

    assert!(matches!(result, Err(CraneError::Timeout(_))));
    assert!(acceptor.is_sunk());
}

fn seal_frame(sealer: &mut Sealer, plaintext: &[u8]) -> Vec<u8> {
    let sealed = sealer.seal(plaintext).unwrap();
    let mut frame = varint::encode(sealed.len() as u64);
    frame.extend_from_slice(&sealed);
    frame
}

#[tokio::test]
async fn test_oversized_shipment_stops_crane() {
    init_logging();
    let (dialer, acceptor) = MemoryShip::pair();
    let (bottle, ring) = relay_identity();
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    let acceptor = Arc::new(acceptor);

    let server = tokio::spawn(Crane::start(
        acceptor.clone(),
        CraneSetup::Responder { keys: ring },
        CraneContext::default().with_acceptor(Arc::new(CollectingAcceptor { lines: lines_tx })),
    ));

    // hand-driven initiator
    let key = bottle.exchange_keys[0].clone();
    let (session, handshake) = Session::initiate(ToolSuite::default(), &[key.clone()]).unwrap();
    let init = Initializer {
        version: PROTOCOL_VERSION,
        tool_suite: ToolSuite::default().id(),
        dest_relay: bottle.id.clone(),
        key_ids: vec![key.id],
        handshake: handshake.encode(),
    };
    assert!(dialer.load(&init.to_frame()).await.unwrap());
    let server = server.await.unwrap().unwrap();
    let mut sealer = session.sealer;

    let mut request = ControllerMsg::NewLineRequest {
        request_id: 1,
        shore_cap: 100,
        init: None,
    }
    .encode();
    request.prepend_number(CONTROLLER_LINE_ID as u64);
    request.prepend_length();
    let mut writer = ShipmentWriter::new(SHIPMENT_SIZE);
    writer.push(&request.into_bytes());
    let shipment = writer.finish().unwrap();
    assert!(dialer.load(&seal_frame(&mut sealer, &shipment)).await.unwrap());

    let (_, mut server_end) = timeout(Duration::from_secs(5), lines_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let mut bad = vec![0u8; SHIPMENT_SIZE];
    bad[..SHIPMENT_PREFIX_SIZE].copy_from_slice(&varint::encode_fixed2(5000).unwrap());
    assert!(dialer.load(&seal_frame(&mut sealer, &bad)).await.unwrap());

    timeout(Duration::from_secs(5), server.stopped())
        .await
        .expect("framing error is fatal");
    assert_eq!(server.status(), CraneStatus::Stopped);
    assert_eq!(server_end.recv().await, StreamEvent::End);
    assert!(acceptor.is_sunk());
}
