//! The engine: root object of a harbor node

use crate::config::{EngineConfig, NodeMode};
use crate::error::{EngineError, EngineResult};
use crate::identity::{validate_bottle, IdentityStore, InMemoryIdentityStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use harbor_api::{Api, ApiAcceptor, CallLine, HandlerRegistry};
use harbor_crane::{
    chain, AnnouncementHandler, Conveyor, Crane, CraneContext, CraneSetup, Docks, TinkerConveyor,
};
use harbor_proto::{AnnouncementScope, DockingSignal};
use harbor_tinker::{Bottle, KeyRing, TinkerError};
use harbor_transport::Ship;
use harbor_transport_tcp::{TcpShipConnector, TcpShipListener};
use harbor_unit::Scheduler;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Records identities announced by peers
struct EngineAnnouncements {
    identities: Arc<dyn IdentityStore>,
}

#[async_trait]
impl AnnouncementHandler for EngineAnnouncements {
    async fn bottle_update(&self, crane_id: &str, scope: AnnouncementScope, data: Bytes) {
        let bottle = match Bottle::from_bytes(&data) {
            Ok(bottle) => bottle,
            Err(e) => {
                debug!(crane_id, ?scope, error = %e, "Ignoring malformed bottle update");
                return;
            }
        };
        debug!(crane_id, relay_id = %bottle.id, "Bottle update");
        if let Err(e) = self.identities.put(bottle).await {
            warn!(crane_id, error = %e, "Failed to store bottle");
        }
    }

    async fn verify_publish(&self, crane_id: &str, data: Bytes) -> Option<String> {
        let bottle = match Bottle::from_bytes(&data) {
            Ok(bottle) => bottle,
            Err(e) => {
                debug!(crane_id, error = %e, "Malformed publish request");
                return None;
            }
        };
        if let Err(e) = validate_bottle(&bottle) {
            debug!(crane_id, error = %e, "Refusing publish");
            return None;
        }
        let relay_id = bottle.id.clone();
        if let Err(e) = self.identities.put(bottle).await {
            warn!(crane_id, error = %e, "Failed to store published bottle");
            return None;
        }
        Some(relay_id)
    }
}

/// Root of a node: owns the docks, the scheduler, the exchange keys, the call
/// handlers and the identity store, and every crane built on top of them.
pub struct Engine {
    config: EngineConfig,
    identity: Bottle,
    keys: KeyRing,
    docks: Arc<Docks>,
    scheduler: Scheduler,
    handlers: Arc<HandlerRegistry>,
    local_handlers: Arc<HandlerRegistry>,
    identities: Arc<dyn IdentityStore>,
    cranes: Mutex<HashMap<String, Arc<Crane>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.config.name)
            .field("mode", &self.config.mode)
            .field("relay_id", &self.identity.id)
            .field("cranes", &self.crane_count())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Arc<Engine>> {
        Self::with_store(config, Arc::new(InMemoryIdentityStore::new()))
    }

    /// Build an engine with a fresh identity and exchange key
    pub fn with_store(
        config: EngineConfig,
        identities: Arc<dyn IdentityStore>,
    ) -> EngineResult<Arc<Engine>> {
        config.validate()?;

        let validity = chrono::Duration::from_std(config.key_validity)
            .map_err(|e| EngineError::Config(format!("key validity: {}", e)))?;
        let keys = KeyRing::new();
        let public = keys.generate(validity);
        let identity = Bottle::generate(config.name.clone()).with_exchange_keys(vec![public]);

        let docks = Arc::new(Docks::new());
        let hop_docks = (config.mode == NodeMode::Relay).then(|| docks.clone());
        let handlers = Arc::new(HandlerRegistry::builtin(config.name.clone(), hop_docks));

        info!(
            name = %config.name,
            mode = %config.mode,
            relay_id = %identity.id,
            "Engine created"
        );

        Ok(Arc::new(Engine {
            scheduler: Scheduler::new(config.scheduler.clone()),
            config,
            identity,
            keys,
            docks,
            handlers,
            local_handlers: Arc::new(HandlerRegistry::new()),
            identities,
            cranes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// This node's identity
    pub fn identity(&self) -> &Bottle {
        &self.identity
    }

    pub fn relay_id(&self) -> &str {
        &self.identity.id
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn docks(&self) -> &Arc<Docks> {
        &self.docks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    pub fn crane_count(&self) -> usize {
        self.cranes.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn cranes(&self) -> Vec<Arc<Crane>> {
        self.cranes
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn crane_context(&self) -> CraneContext {
        let announcements = Arc::new(EngineAnnouncements {
            identities: self.identities.clone(),
        });
        let ctx = CraneContext::default()
            .with_config(self.config.crane.clone())
            .with_scheduler(self.scheduler.clone())
            .with_docks(self.docks.clone())
            .with_announcements(announcements);

        match self.config.mode {
            NodeMode::Relay => ctx.with_acceptor(Arc::new(
                ApiAcceptor::new(self.identity.id.clone(), self.keys.clone(), self.handlers.clone())
                    .require_encryption(self.config.require_encryption),
            )),
            NodeMode::Client => ctx,
        }
    }

    fn track(self: &Arc<Self>, crane: &Arc<Crane>) {
        if let Ok(mut cranes) = self.cranes.lock() {
            cranes.insert(crane.id().to_string(), crane.clone());
        }

        let engine: Weak<Engine> = Arc::downgrade(self);
        let crane = crane.clone();
        tokio::spawn(async move {
            crane.stopped().await;
            if let Some(engine) = engine.upgrade() {
                if let Ok(mut cranes) = engine.cranes.lock() {
                    cranes.remove(crane.id());
                }
            }
        });
    }

    /// Run a crane on a ship a peer opened to us
    pub async fn accept_ship(self: &Arc<Self>, ship: Arc<dyn Ship>) -> EngineResult<Arc<Crane>> {
        if self.is_shut_down() {
            ship.sink().await;
            return Err(EngineError::Shutdown);
        }
        let setup = CraneSetup::Responder {
            keys: self.keys.clone(),
        };
        let crane = Crane::start(ship, setup, self.crane_context()).await?;
        self.track(&crane);
        Ok(crane)
    }

    /// Run a crane on a ship we opened to the relay described by `server`.
    ///
    /// Relays publish themselves on the new crane so the peer can route back.
    pub async fn connect_ship(
        self: &Arc<Self>,
        ship: Arc<dyn Ship>,
        server: &Bottle,
    ) -> EngineResult<Arc<Crane>> {
        if self.is_shut_down() {
            ship.sink().await;
            return Err(EngineError::Shutdown);
        }
        self.identities.put(server.clone()).await?;

        let setup = CraneSetup::Initiator {
            server: server.clone(),
        };
        let crane = Crane::start(ship, setup, self.crane_context()).await?;
        self.track(&crane);

        if self.config.mode == NodeMode::Relay {
            match crane.publish(self.identity.to_bytes()?).await {
                Ok(true) => debug!(crane_id = %crane.id(), "Published to peer"),
                Ok(false) => warn!(crane_id = %crane.id(), relay_id = %server.id, "Peer refused publish"),
                Err(e) => warn!(crane_id = %crane.id(), error = %e, "Publish failed"),
            }
        }
        Ok(crane)
    }

    /// Dial a relay over TCP
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr, server: &Bottle) -> EngineResult<Arc<Crane>> {
        let connector = TcpShipConnector::new(Arc::new(self.config.tcp.clone()));
        let ship = connector.connect(addr).await?;
        info!(address = %addr, relay_id = %server.id, "Connected to relay");
        self.connect_ship(Arc::new(ship), server).await
    }

    /// Accept ships on `addr` until the engine shuts down. Returns the bound
    /// address.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> EngineResult<SocketAddr> {
        let listener = TcpShipListener::bind(addr, Arc::new(self.config.tcp.clone())).await?;
        let local = listener.local_addr();
        info!(address = %local, "Listening for ships");

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (ship, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Listener failed");
                        break;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.accept_ship(Arc::new(ship)).await {
                        debug!(peer = %peer, error = %e, "Incoming ship failed");
                    }
                });
            }
            debug!(address = %local, "Listener stopped");
        });
        Ok(local)
    }

    /// Open an API on a new line of `crane`. With `dest` the line is encrypted
    /// end to end towards that relay.
    pub async fn open_api(&self, crane: &Arc<Crane>, dest: Option<&Bottle>) -> EngineResult<Api> {
        let (init, conveyors) = match dest {
            Some(dest) => {
                let (tinker, init) = self.tinker_for(dest)?;
                let conveyors: Vec<Box<dyn Conveyor>> = vec![Box::new(tinker)];
                (Some(init), conveyors)
            }
            None => (None, Vec::new()),
        };
        let (line_id, end) = crane.establish_line(init, conveyors).await?;
        debug!(crane_id = %crane.id(), line_id, "API line open");
        Ok(Api::start(end, true, self.local_handlers.clone()))
    }

    /// Extend a route by one hop: the relay behind `api` opens a line to
    /// `dest`, and a new API runs end-to-end encrypted through it
    pub async fn hop(&self, api: &Api, dest: &Bottle) -> EngineResult<Api> {
        let (tinker, init) = self.tinker_for(dest)?;
        let end = CallLine::open(api, &dest.id, Some(&init)).await?;
        let end = chain(end, vec![Box::new(tinker)], self.config.crane.link_depth);
        Ok(Api::start(end, true, self.local_handlers.clone()))
    }

    /// Build a route through `path`, starting at a relay we have a crane to.
    ///
    /// Returns the APIs of every hop, innermost last.
    pub async fn route(&self, path: &[Bottle]) -> EngineResult<Vec<Api>> {
        let Some((first, rest)) = path.split_first() else {
            return Err(EngineError::Config("empty route".into()));
        };
        let crane = self.docks.get(&first.id).ok_or_else(|| {
            EngineError::Config(format!("no crane docked for {}", first.id))
        })?;

        let mut apis = vec![self.open_api(&crane, Some(first)).await?];
        for dest in rest {
            let next = match apis.last() {
                Some(api) => self.hop(api, dest).await?,
                None => break,
            };
            apis.push(next);
        }
        Ok(apis)
    }

    fn tinker_for(&self, dest: &Bottle) -> EngineResult<(TinkerConveyor, harbor_proto::Initializer)> {
        let key = dest
            .select_exchange_key(chrono::Utc::now())
            .ok_or(TinkerError::NoUsableKey)?;
        Ok(TinkerConveyor::initiate(dest.id.clone(), std::slice::from_ref(key))?)
    }

    /// Send our identity to every connected peer
    pub fn announce(&self) -> EngineResult<usize> {
        let data = self.identity.to_bytes()?;
        let cranes = self.cranes();
        for crane in &cranes {
            crane.send_bottle_update(AnnouncementScope::Global, data.clone());
        }
        Ok(cranes.len())
    }

    /// Answer a docking datagram. A seagull is answered with our bottle;
    /// bottles from peers are recorded.
    pub async fn on_docking_signal(&self, datagram: &[u8]) -> EngineResult<Option<Bytes>> {
        match DockingSignal::parse(datagram) {
            Some(DockingSignal::Seagull) => {
                let bottle = self.identity.to_bytes()?;
                Ok(Some(DockingSignal::Bottle(bottle).encode()))
            }
            Some(DockingSignal::Bottle(data)) => {
                let bottle = Bottle::from_bytes(&data)?;
                if bottle.id != self.identity.id {
                    validate_bottle(&bottle)?;
                    debug!(relay_id = %bottle.id, "Docking bottle received");
                    self.identities.put(bottle).await?;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Answer docking datagrams on `addr` until the engine shuts down.
    /// Returns the bound address.
    pub async fn serve_docking(self: &Arc<Self>, addr: SocketAddr) -> EngineResult<SocketAddr> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        info!(address = %local, "Answering docking signals");

        let engine = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "Docking receive failed");
                        continue;
                    }
                };
                match engine.on_docking_signal(&buf[..len]).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            debug!(peer = %peer, error = %e, "Docking reply failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(peer = %peer, error = %e, "Bad docking signal"),
                }
            }
        });
        Ok(local)
    }

    /// Listen on the configured addresses, dial the bootstrap peers and wait
    /// for shutdown
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        for addr in self.config.listen_addrs() {
            let bound = self.listen(addr).await?;
            if self.config.docking {
                self.serve_docking(bound).await?;
            }
        }
        for peer in &self.config.peers {
            if let Err(e) = self.connect(peer.address, &peer.bottle).await {
                warn!(address = %peer.address, relay_id = %peer.bottle.id, error = %e, "Bootstrap peer unreachable");
            }
        }
        self.shutdown.cancelled().await;
        Ok(())
    }

    /// Stop every crane and release the scheduler. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let cranes: Vec<Arc<Crane>> = match self.cranes.lock() {
            Ok(mut cranes) => cranes.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        let count = cranes.len();
        join_all(cranes.iter().map(|crane| crane.stop("engine shutdown"))).await;
        self.scheduler.release();
        info!(name = %self.config.name, cranes = count, "Engine shut down");
    }
}
