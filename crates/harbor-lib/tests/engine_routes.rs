//! Routes across several engines connected by in-memory and TCP ships

use harbor_lib::api::{handler_id, ApiError};
use harbor_lib::crane::{Crane, CraneStatus};
use harbor_lib::proto::{ApiMsgType, Container, DockingSignal};
use harbor_lib::transport::MemoryShip;
use harbor_lib::{Engine, EngineConfig, EngineError, IdentityStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

const WAIT: Duration = Duration::from_secs(5);

fn relay(name: &str) -> Arc<Engine> {
    Engine::new(EngineConfig::relay(name)).unwrap()
}

/// Connect `dialer` to `server` over an in-memory ship
async fn link(dialer: &Arc<Engine>, server: &Arc<Engine>) -> Arc<Crane> {
    let (near, far) = MemoryShip::pair();
    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.accept_ship(Arc::new(far)).await })
    };
    let crane = dialer
        .connect_ship(Arc::new(near), server.identity())
        .await
        .unwrap();
    accept.await.unwrap().unwrap();
    crane
}

#[tokio::test]
async fn test_three_hop_route() {
    init_logging();
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    let port2 = relay("Port2");
    let port3 = relay("Port3");
    let port4 = relay("Port4");

    link(&client, &port2).await;
    link(&port2, &port3).await;
    link(&port3, &port4).await;

    let path = vec![
        port2.identity().clone(),
        port3.identity().clone(),
        port4.identity().clone(),
    ];
    let apis = client.route(&path).await.unwrap();
    assert_eq!(apis.len(), 3);

    for (api, name) in apis.iter().zip(["Port2", "Port3", "Port4"]) {
        let mut call = api.call(handler_id::INFO, Container::new()).await.unwrap();
        let mut reply = call.reply(WAIT).await.unwrap();
        assert_eq!(reply.get_all().as_ref(), format!("name={}", name).as_bytes());
    }

    let inner = &apis[2];
    let mut call = inner
        .call(handler_id::ECHO, Container::from_bytes("three hops"))
        .await
        .unwrap();
    assert_eq!(call.reply(WAIT).await.unwrap().get_all().as_ref(), b"spoh eerht");

    // losing the middle relay tears down every hop behind it
    port3.shutdown().await;
    timeout(WAIT, inner.closed()).await.expect("inner API closed");
    timeout(WAIT, apis[1].closed()).await.expect("middle API closed");
    assert!(!apis[0].is_abandoned());
}

#[tokio::test]
async fn test_err_does_not_close_routed_call() {
    init_logging();
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    let port2 = relay("Port2");
    let port3 = relay("Port3");
    link(&client, &port2).await;
    link(&port2, &port3).await;

    let apis = client
        .route(&[port2.identity().clone(), port3.identity().clone()])
        .await
        .unwrap();
    let api = &apis[1];

    let mut call = api
        .call(handler_id::TEST, Container::from_bytes(vec![ApiMsgType::Err as u8]))
        .await
        .unwrap();
    let msg = call.recv_timeout(WAIT).await.unwrap();
    assert_eq!(msg.msg_type, ApiMsgType::Err);
    assert!(!call.is_ended());
    assert_eq!(api.active_calls(), 1);
    call.end().await;
    assert_eq!(api.active_calls(), 0);
    // nothing is delivered on the call after END
    match call.recv_timeout(Duration::from_millis(100)).await {
        Err(ApiError::Ended) | Err(ApiError::Timeout(_)) => {}
        other => panic!("expected an ended call, got {:?}", other),
    }
}

#[tokio::test]
async fn test_outer_shutdown_closes_every_hop() {
    init_logging();
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    let port2 = relay("Port2");
    let port3 = relay("Port3");
    let port4 = relay("Port4");
    link(&client, &port2).await;
    link(&port2, &port3).await;
    link(&port3, &port4).await;

    let apis = client
        .route(&[
            port2.identity().clone(),
            port3.identity().clone(),
            port4.identity().clone(),
        ])
        .await
        .unwrap();

    apis[0].shutdown();
    timeout(WAIT, apis[1].closed()).await.expect("middle API closed");
    timeout(WAIT, apis[2].closed()).await.expect("inner API closed");
    for api in &apis {
        assert!(api.call(handler_id::INFO, Container::new()).await.is_err());
    }
}

#[tokio::test]
async fn test_hop_without_route() {
    init_logging();
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    let port2 = relay("Port2");
    let stranger = relay("Port9");
    link(&client, &port2).await;

    let crane = client.docks().get(port2.relay_id()).unwrap();
    let api = client.open_api(&crane, Some(port2.identity())).await.unwrap();
    match client.hop(&api, stranger.identity()).await {
        Err(EngineError::Api(ApiError::Temporary(msg))) => {
            assert!(msg.contains(stranger.relay_id()), "unexpected message {}", msg);
        }
        other => panic!("expected temporary error, got {:?}", other.map(|_| ())),
    }
    // the API survives a failed hop
    let mut call = api.call(handler_id::INFO, Container::new()).await.unwrap();
    assert!(call.reply(WAIT).await.is_ok());
}

#[tokio::test]
async fn test_client_serves_no_lines() {
    init_logging();
    let port2 = relay("Port2");
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    link(&port2, &client).await;

    // port2 dialed the client, so the client never serves lines for it
    let crane = port2.docks().get(client.relay_id()).unwrap();
    assert!(port2.open_api(&crane, None).await.is_err());
}

#[tokio::test]
async fn test_relay_publishes_on_connect() {
    init_logging();
    let port2 = relay("Port2");
    let port3 = relay("Port3");
    let crane = link(&port2, &port3).await;

    assert_eq!(crane.status(), CraneStatus::Published);
    assert!(port3.docks().get(port2.relay_id()).is_some());
    let known = port3.identities().get(port2.relay_id()).await.unwrap();
    assert_eq!(known.map(|b| b.name), Some("Port2".to_string()));
}

#[tokio::test]
async fn test_announce_reaches_peers() {
    init_logging();
    // clients never publish, so peers only learn them from announcements
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();
    let port3 = relay("Port3");
    let port4 = relay("Port4");
    link(&client, &port3).await;
    link(&client, &port4).await;
    assert!(port3.identities().get(client.relay_id()).await.unwrap().is_none());

    assert_eq!(client.announce().unwrap(), 2);
    timeout(WAIT, async {
        loop {
            let at3 = port3.identities().get(client.relay_id()).await.unwrap();
            let at4 = port4.identities().get(client.relay_id()).await.unwrap();
            if at3.is_some() && at4.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bottle announced");
}

#[tokio::test]
async fn test_docking_signals() {
    init_logging();
    let port2 = relay("Port2");
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();

    let reply = port2
        .on_docking_signal(&DockingSignal::Seagull.encode())
        .await
        .unwrap()
        .expect("seagull answered");
    assert!(client.on_docking_signal(&reply).await.unwrap().is_none());

    let stored = client.identities().get(port2.relay_id()).await.unwrap();
    assert_eq!(stored.map(|b| b.id), Some(port2.relay_id().to_string()));

    assert!(client.on_docking_signal(b"noise").await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_stops_cranes() {
    init_logging();
    let port2 = relay("Port2");
    let port3 = relay("Port3");
    let crane = link(&port2, &port3).await;
    assert_eq!(port2.crane_count(), 1);

    port2.shutdown().await;
    port2.shutdown().await;
    assert!(port2.is_shut_down());
    assert_eq!(port2.crane_count(), 0);
    assert!(crane.is_stopped());

    timeout(WAIT, async {
        while port3.crane_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer crane stopped");

    let (ship, _) = MemoryShip::pair();
    assert!(matches!(
        port2.accept_ship(Arc::new(ship)).await,
        Err(EngineError::Shutdown)
    ));
}

#[tokio::test]
async fn test_route_over_tcp() {
    init_logging();
    let port2 = relay("Port2");
    let client = Engine::new(EngineConfig::client("laptop")).unwrap();

    let addr = port2.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let crane = client.connect(addr, port2.identity()).await.unwrap();

    let api = client.open_api(&crane, Some(port2.identity())).await.unwrap();
    let mut call = api
        .call(handler_id::ECHO, Container::from_bytes("over tcp"))
        .await
        .unwrap();
    assert_eq!(call.reply(WAIT).await.unwrap().get_all().as_ref(), b"pct revo");

    client.shutdown().await;
    port2.shutdown().await;
}

#[tokio::test]
async fn test_docking_over_udp() {
    init_logging();
    let port2 = relay("Port2");
    let addr = port2
        .serve_docking("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&DockingSignal::Seagull.encode(), addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 64 * 1024];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, addr);
    match DockingSignal::parse(&buf[..len]) {
        Some(DockingSignal::Bottle(data)) => {
            let bottle = harbor_lib::tinker::Bottle::from_bytes(&data).unwrap();
            assert_eq!(bottle.id, port2.relay_id());
        }
        other => panic!("expected a bottle, got {:?}", other),
    }
    port2.shutdown().await;
}
