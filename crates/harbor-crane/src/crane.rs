//! Cranes: encrypted multiplexers on top of a ship

use crate::config::CraneConfig;
use crate::controller::{AnnouncementHandler, Controller, LineAcceptor};
use crate::conveyor::{Conveyor, LineEnd};
use crate::docks::Docks;
use crate::error::{CraneError, CraneResult};
use crate::line::{DeliverError, Line};
use crate::shipment::{wire_segment, ShipmentReader, ShipmentWriter, WireReader};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use harbor_proto::{
    AnnouncementScope, Container, ControllerMsg, Initializer, CONTROLLER_LINE_ID,
    PROTOCOL_VERSION,
};
use harbor_tinker::{
    Bottle, Handshake, KeyRing, Opener, Sealer, Session, TinkerError, ToolSuite,
};
use harbor_transport::{Ship, ShipError};
use harbor_unit::Scheduler;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Largest initializer accepted during the handshake
const MAX_INITIALIZER_SIZE: usize = 2048;

/// Line IDs available to each side (even for the initiator, odd for the
/// responder), keeping every ID below 2^31
const LINE_ID_SLOTS: u32 = (1 << 30) - 1;

/// Publication state of a crane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CraneStatus {
    Stopped,
    Private,
    PublishRequested,
    PublishVerifying,
    Published,
}

impl fmt::Display for CraneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CraneStatus::Stopped => "stopped",
            CraneStatus::Private => "private",
            CraneStatus::PublishRequested => "publish-requested",
            CraneStatus::PublishVerifying => "publish-verifying",
            CraneStatus::Published => "published",
        };
        f.write_str(name)
    }
}

/// How the crane sets up its session
pub enum CraneSetup {
    /// We dialed; encrypt towards the relay described by `server`
    Initiator { server: Bottle },
    /// We were dialed; answer with our exchange keys
    Responder { keys: KeyRing },
}

/// Shared services a crane works with
#[derive(Clone, Default)]
pub struct CraneContext {
    pub config: CraneConfig,
    /// Shared scheduler. Without one the crane runs its own and releases it
    /// when it stops.
    pub scheduler: Option<Scheduler>,
    pub docks: Option<Arc<Docks>>,
    pub acceptor: Option<Arc<dyn LineAcceptor>>,
    pub announcements: Option<Arc<dyn AnnouncementHandler>>,
}

impl CraneContext {
    pub fn with_config(mut self, config: CraneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_docks(mut self, docks: Arc<Docks>) -> Self {
        self.docks = Some(docks);
        self
    }

    pub fn with_acceptor(mut self, acceptor: Arc<dyn LineAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_announcements(mut self, handler: Arc<dyn AnnouncementHandler>) -> Self {
        self.announcements = Some(handler);
        self
    }
}

/// Hands out line IDs of one parity, skipping IDs still in use
#[derive(Debug)]
pub struct LineIdAllocator {
    counter: AtomicU32,
    first: u32,
}

impl LineIdAllocator {
    pub fn new(initiator: bool) -> Self {
        Self {
            counter: AtomicU32::new(0),
            first: if initiator { 2 } else { 1 },
        }
    }

    pub fn next(&self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            let n = self.counter.fetch_add(1, Ordering::AcqRel) % LINE_ID_SLOTS;
            let id = self.first + 2 * n;
            if !in_use(id) {
                return id;
            }
        }
    }

    /// Whether `id` belongs to this allocator's range
    pub fn owns(&self, id: u32) -> bool {
        id != CONTROLLER_LINE_ID && id % 2 == self.first % 2
    }
}

/// A multiplexed, encrypted channel to an adjacent relay
pub struct Crane {
    id: String,
    ship: Arc<dyn Ship>,
    config: CraneConfig,
    initiator: bool,
    status: RwLock<CraneStatus>,
    remote_relay: RwLock<Option<String>>,
    lines: RwLock<HashMap<u32, Arc<Line>>>,
    line_ids: LineIdAllocator,
    to_ship: mpsc::Sender<Container>,
    priority: mpsc::UnboundedSender<Container>,
    controller: Controller,
    scheduler: Scheduler,
    owns_scheduler: bool,
    docks: Weak<Docks>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for Crane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crane")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("status", &self.status())
            .field("remote", &self.ship.remote_address())
            .finish_non_exhaustive()
    }
}

fn random_crane_id() -> String {
    let raw: [u8; 3] = rand::thread_rng().gen();
    hex::encode(raw)
}

struct Established {
    session: Session,
    reader: WireReader,
    remote_relay: Option<String>,
}

async fn handshake(
    ship: &Arc<dyn Ship>,
    setup: &CraneSetup,
) -> CraneResult<Established> {
    match setup {
        CraneSetup::Initiator { server } => {
            let key = server
                .select_exchange_key(Utc::now())
                .ok_or(TinkerError::NoUsableKey)?
                .clone();
            let suite = ToolSuite::default();
            let (session, handshake) = Session::initiate(suite, std::slice::from_ref(&key))?;
            let init = Initializer {
                version: PROTOCOL_VERSION,
                tool_suite: suite.id(),
                dest_relay: server.id.clone(),
                key_ids: vec![key.id],
                handshake: handshake.encode(),
            };
            if !ship.load(&init.to_frame()).await? {
                return Err(ShipError::Sunk.into());
            }
            Ok(Established {
                session,
                reader: WireReader::new(ship.clone()),
                remote_relay: Some(server.id.clone()),
            })
        }
        CraneSetup::Responder { keys } => {
            let mut reader = WireReader::new(ship.clone());
            let frame = reader
                .next_segment(MAX_INITIALIZER_SIZE)
                .await?
                .ok_or(ShipError::Sunk)?;
            let init = Initializer::decode(&mut Container::from_bytes(frame))?;
            if init.version != PROTOCOL_VERSION {
                return Err(CraneError::Protocol(format!(
                    "unsupported protocol version {}",
                    init.version
                )));
            }
            let suite = ToolSuite::try_from(init.tool_suite)?;
            let handshake = Handshake::decode(&init.handshake)?;
            let session = Session::respond(suite, &init.key_ids, &handshake, keys)?;
            trace!(dest_relay = %init.dest_relay, key_ids = ?init.key_ids, "Initializer accepted");
            Ok(Established {
                session,
                reader,
                remote_relay: None,
            })
        }
    }
}

impl Crane {
    /// Run the key exchange on `ship` and start the crane's workers.
    ///
    /// On failure the ship is sunk.
    pub async fn start(
        ship: Arc<dyn Ship>,
        setup: CraneSetup,
        ctx: CraneContext,
    ) -> CraneResult<Arc<Crane>> {
        let initiator = matches!(setup, CraneSetup::Initiator { .. });
        let deadline = ctx.config.handshake_timeout;

        let established = match tokio::time::timeout(deadline, handshake(&ship, &setup)).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!(remote = %ship.remote_address(), error = %e, "Crane handshake failed");
                ship.sink().await;
                return Err(e);
            }
            Err(_) => {
                warn!(remote = %ship.remote_address(), "Crane handshake timed out");
                ship.sink().await;
                return Err(CraneError::Timeout("crane handshake"));
            }
        };

        let (scheduler, owns_scheduler) = match &ctx.scheduler {
            Some(shared) => (shared.clone(), false),
            None => (Scheduler::default(), true),
        };
        if scheduler.start().is_some() {
            debug!(owned = owns_scheduler, "Scheduler started for crane");
        }

        let (to_ship_tx, to_ship_rx) = mpsc::channel(ctx.config.to_ship_depth);
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (from_ship_tx, from_ship_rx) = mpsc::channel(ctx.config.from_ship_depth);

        let crane = Arc::new(Crane {
            id: random_crane_id(),
            ship,
            config: ctx.config.clone(),
            initiator,
            status: RwLock::new(CraneStatus::Private),
            remote_relay: RwLock::new(established.remote_relay.clone()),
            lines: RwLock::new(HashMap::new()),
            line_ids: LineIdAllocator::new(initiator),
            to_ship: to_ship_tx,
            priority: priority_tx,
            controller: Controller::new(ctx.acceptor.clone(), ctx.announcements.clone()),
            scheduler,
            owns_scheduler,
            docks: ctx.docks.as_ref().map(Arc::downgrade).unwrap_or_default(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            started_at: Utc::now(),
        });

        let Session { sealer, opener, .. } = established.session;
        tokio::spawn(run_loader(crane.clone(), sealer, to_ship_rx, priority_rx));
        tokio::spawn(run_unloader(crane.clone(), established.reader, from_ship_tx));
        tokio::spawn(run_handler(crane.clone(), opener, from_ship_rx));

        info!(
            crane_id = %crane.id,
            remote = %crane.ship.remote_address(),
            transport = crane.ship.transport_name(),
            initiator,
            "Crane started"
        );

        if let (Some(relay_id), Some(docks)) = (established.remote_relay, ctx.docks) {
            docks.assign(relay_id, crane.clone());
        }

        Ok(crane)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CraneConfig {
        &self.config
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn ship(&self) -> &Arc<dyn Ship> {
        &self.ship
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> CraneStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(CraneStatus::Stopped)
    }

    pub(crate) fn set_status(&self, status: CraneStatus) {
        if self.is_stopped() {
            return;
        }
        if let Ok(mut current) = self.status.write() {
            debug!(crane_id = %self.id, from = %*current, to = %status, "Crane status");
            *current = status;
        }
    }

    /// Relay this crane leads to, once known
    pub fn remote_relay(&self) -> Option<String> {
        self.remote_relay.read().ok().and_then(|r| r.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait until the crane has stopped
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn line(&self, line_id: u32) -> Option<Arc<Line>> {
        self.lines.read().ok()?.get(&line_id).cloned()
    }

    pub fn line_count(&self) -> usize {
        self.lines.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn line_ids(&self) -> Vec<u32> {
        self.lines
            .read()
            .map(|l| l.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn is_peer_line_id(&self, line_id: u32) -> bool {
        line_id != CONTROLLER_LINE_ID && !self.line_ids.owns(line_id)
    }

    pub(crate) fn dock_as(self: &Arc<Self>, relay_id: String) {
        if let Ok(mut remote) = self.remote_relay.write() {
            *remote = Some(relay_id.clone());
        }
        if let Some(docks) = self.docks.upgrade() {
            docks.assign(relay_id, self.clone());
        }
    }

    /// Create and register a line. With `line_id` unset a fresh ID from our
    /// own range is allocated.
    pub(crate) fn open_line(
        self: &Arc<Self>,
        line_id: Option<u32>,
        shore_cap: u32,
        ship_space: u32,
        conveyors: Vec<Box<dyn Conveyor>>,
    ) -> CraneResult<(u32, LineEnd)> {
        if self.is_stopped() {
            return Err(CraneError::Stopped);
        }
        let mut lines = self
            .lines
            .write()
            .map_err(|_| CraneError::Protocol("line table poisoned".into()))?;

        let id = match line_id {
            Some(id) if lines.contains_key(&id) => {
                return Err(CraneError::Protocol(format!("line {} already exists", id)))
            }
            Some(id) => id,
            None => self.line_ids.next(|id| lines.contains_key(&id)),
        };

        let (line, end) = Line::spawn(
            self,
            id,
            shore_cap,
            ship_space,
            conveyors,
            self.scheduler.clone(),
            self.config.link_depth,
        );
        lines.insert(id, line);
        Ok((id, end))
    }

    fn remove_line(&self, line_id: u32) -> Option<Arc<Line>> {
        self.lines.write().ok()?.remove(&line_id)
    }

    /// Drop a line without telling the peer
    pub(crate) fn close_line(&self, line_id: u32) {
        if let Some(line) = self.remove_line(line_id) {
            debug!(crane_id = %self.id, line_id, "Line closed");
            line.abandon();
        }
    }

    /// Close a line and tell the peer.
    ///
    /// The notice travels behind the line's data so it cannot overtake it.
    pub async fn discard_line(&self, line_id: u32) {
        let Some(line) = self.remove_line(line_id) else {
            return;
        };
        debug!(crane_id = %self.id, line_id, "Line discarded");
        line.abandon();

        if !self.is_stopped() {
            let mut c = ControllerMsg::LineDiscard { line_id }.encode();
            c.prepend_number(CONTROLLER_LINE_ID as u64);
            c.prepend_length();
            let _ = self.to_ship.send(c).await;
        }
    }

    /// Queue a controller message ahead of line traffic
    pub fn send_controller(&self, msg: ControllerMsg) {
        trace!(crane_id = %self.id, opcode = msg.opcode(), "Controller send");
        self.send_priority(CONTROLLER_LINE_ID, msg.encode());
    }

    fn send_priority(&self, line_id: u32, mut c: Container) {
        c.prepend_number(line_id as u64);
        c.prepend_length();
        let _ = self.priority.send(c);
    }

    pub(crate) fn report_line_space(&self, line_id: u32, delta: u32) {
        trace!(crane_id = %self.id, line_id, delta, "Reporting line space");
        self.send_controller(ControllerMsg::LineSpace { line_id, delta });
    }

    /// Frame a line container and queue it for the loader.
    ///
    /// Returns whether anything was queued: empty containers are dropped,
    /// since on the wire they mean "line closed".
    pub async fn dispatch_container(&self, line_id: u32, mut c: Container) -> CraneResult<bool> {
        if self.is_stopped() {
            return Err(CraneError::Stopped);
        }
        if c.is_empty() {
            return Ok(false);
        }
        c.prepend_number(line_id as u64);
        if c.len() > self.config.max_container_size {
            return Err(CraneError::Framing(format!(
                "container of {} bytes exceeds {}",
                c.len(),
                self.config.max_container_size
            )));
        }
        c.prepend_length();
        self.to_ship
            .send(c)
            .await
            .map(|()| true)
            .map_err(|_| CraneError::Stopped)
    }

    /// Ask the peer for a new line.
    ///
    /// `init` carries an end-to-end handshake for the line's destination;
    /// `conveyors` are placed between the crane and the returned end.
    pub async fn establish_line(
        self: &Arc<Self>,
        init: Option<Initializer>,
        conveyors: Vec<Box<dyn Conveyor>>,
    ) -> CraneResult<(u32, LineEnd)> {
        if self.is_stopped() {
            return Err(CraneError::Stopped);
        }
        let shore_cap = self.config.default_shore_cap;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = self.controller.add_pending(shore_cap, conveyors, reply_tx);

        self.send_controller(ControllerMsg::NewLineRequest {
            request_id,
            shore_cap,
            init,
        });

        match tokio::time::timeout(self.config.line_setup_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CraneError::Stopped),
            Err(_) => {
                self.controller.cancel_pending(request_id);
                Err(CraneError::Timeout("line setup"))
            }
        }
    }

    /// Ask the peer to publish our identity. Returns whether it was accepted.
    pub async fn publish(&self, bottle: Bytes) -> CraneResult<bool> {
        if self.status() != CraneStatus::Private {
            return Err(CraneError::Protocol(format!(
                "cannot publish while {}",
                self.status()
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.controller.set_publish_waiter(tx);
        self.set_status(CraneStatus::PublishRequested);
        self.send_controller(ControllerMsg::Publish { data: bottle });

        let accepted = match tokio::time::timeout(self.config.line_setup_timeout, rx).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(_)) => return Err(CraneError::Stopped),
            Err(_) => {
                self.set_status(CraneStatus::Private);
                return Err(CraneError::Timeout("publish ack"));
            }
        };

        self.set_status(if accepted {
            CraneStatus::Published
        } else {
            CraneStatus::Private
        });
        Ok(accepted)
    }

    /// Forward an identity announcement to the peer
    pub fn send_bottle_update(&self, scope: AnnouncementScope, data: Bytes) {
        self.send_controller(ControllerMsg::BottleUpdate { scope, data });
    }

    /// Route a complete inbound container
    fn route(self: &Arc<Self>, line_id: u32, c: Container) -> CraneResult<()> {
        if line_id == CONTROLLER_LINE_ID {
            let msg = ControllerMsg::decode(c)?;
            trace!(crane_id = %self.id, opcode = msg.opcode(), "Controller receive");
            return self.controller.handle(self, msg);
        }

        let Some(line) = self.line(line_id) else {
            if !c.is_empty() {
                trace!(crane_id = %self.id, line_id, "Container for unknown line");
                self.send_priority(line_id, Container::new());
            }
            return Ok(());
        };

        if c.is_empty() {
            debug!(crane_id = %self.id, line_id, "Line closed by peer");
            self.close_line(line_id);
            return Ok(());
        }

        match line.deliver(c) {
            Ok(Some(delta)) => self.report_line_space(line_id, delta),
            Ok(None) => {}
            Err(DeliverError::Saturated) => {
                warn!(
                    crane_id = %self.id,
                    error = %CraneError::LineSaturated(line_id),
                    "Discarding line"
                );
                self.close_line(line_id);
                self.send_priority(line_id, Container::new());
            }
            Err(DeliverError::Closed) => {
                self.close_line(line_id);
                self.send_priority(line_id, Container::new());
            }
        }
        Ok(())
    }

    /// Stop the crane: every line ends, the ship is sunk and the crane leaves
    /// the docks. Only the first call has any effect.
    pub async fn stop(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut status) = self.status.write() {
            *status = CraneStatus::Stopped;
        }
        info!(crane_id = %self.id, reason, "Crane stopped");

        self.cancel.cancel();

        let lines: Vec<Arc<Line>> = match self.lines.write() {
            Ok(mut lines) => lines.drain().map(|(_, line)| line).collect(),
            Err(_) => Vec::new(),
        };
        for line in lines {
            line.abandon();
        }
        self.controller.clear();

        if self.owns_scheduler {
            self.scheduler.release();
        }

        self.ship.sink().await;

        if let Some(docks) = self.docks.upgrade() {
            docks.retract_crane(&self.id);
        }
    }
}

async fn ship_shipment(
    crane: &Crane,
    writer: &mut ShipmentWriter,
    sealer: &mut Sealer,
) -> CraneResult<()> {
    let shipment = writer.finish()?;
    let sealed = sealer.seal(&shipment)?;
    if !crane.ship.load(&wire_segment(&sealed)).await? {
        return Err(CraneError::Stopped);
    }
    Ok(())
}

/// Packs queued containers into shipments and writes them to the ship
async fn run_loader(
    crane: Arc<Crane>,
    mut sealer: Sealer,
    mut to_ship: mpsc::Receiver<Container>,
    mut priority: mpsc::UnboundedReceiver<Container>,
) {
    let mut writer = ShipmentWriter::new(crane.config.max_shipment_size);
    let flush = tokio::time::sleep(crane.config.flush_delay);
    tokio::pin!(flush);
    let mut armed = false;

    let result: CraneResult<()> = async {
        loop {
            let data: Bytes = tokio::select! {
                biased;
                _ = crane.cancel.cancelled() => return Ok(()),
                Some(c) = priority.recv() => c.into_bytes(),
                Some(c) = to_ship.recv() => c.into_bytes(),
                _ = &mut flush, if armed => {
                    armed = false;
                    ship_shipment(&crane, &mut writer, &mut sealer).await?;
                    continue;
                }
                else => return Ok(()),
            };

            let mut offset = 0;
            while offset < data.len() {
                offset += writer.push(&data[offset..]);
                if writer.is_full() {
                    ship_shipment(&crane, &mut writer, &mut sealer).await?;
                    armed = false;
                }
            }

            if !armed && !writer.is_empty() {
                flush.as_mut().reset(Instant::now() + crane.config.flush_delay);
                armed = true;
            }
        }
    }
    .await;

    if let Err(e) = result {
        if !crane.is_stopped() {
            error!(crane_id = %crane.id, error = %e, "Crane loader failed");
        }
        crane.stop(&e.to_string()).await;
    }
}

/// Reads wire segments off the ship
async fn run_unloader(crane: Arc<Crane>, mut reader: WireReader, tx: mpsc::Sender<Bytes>) {
    let limit = crane.config.max_wire_size;
    loop {
        let segment = tokio::select! {
            biased;
            _ = crane.cancel.cancelled() => return,
            segment = reader.next_segment(limit) => segment,
        };

        match segment {
            Ok(Some(segment)) => {
                if tx.send(segment).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                crane.stop("ship sunk").await;
                return;
            }
            Err(e) => {
                warn!(crane_id = %crane.id, error = %e, "Crane unloader failed");
                crane.stop(&e.to_string()).await;
                return;
            }
        }
    }
}

/// Decrypts shipments and routes their containers
async fn run_handler(crane: Arc<Crane>, mut opener: Opener, mut rx: mpsc::Receiver<Bytes>) {
    let mut reader = ShipmentReader::new(
        crane.config.max_shipment_size,
        crane.config.max_container_size,
    );

    loop {
        let segment = tokio::select! {
            biased;
            _ = crane.cancel.cancelled() => return,
            segment = rx.recv() => segment,
        };
        let Some(segment) = segment else {
            return;
        };

        let result: CraneResult<()> = async {
            let plaintext = opener.open(&segment)?;
            for (line_id, c) in reader.feed(&plaintext)? {
                crane.route(line_id, c)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(crane_id = %crane.id, error = %e, "Crane handler failed");
            crane.stop(&e.to_string()).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocator_parity() {
        let initiator = LineIdAllocator::new(true);
        let responder = LineIdAllocator::new(false);
        assert_eq!(initiator.next(|_| false), 2);
        assert_eq!(initiator.next(|_| false), 4);
        assert_eq!(responder.next(|_| false), 1);
        assert_eq!(responder.next(|_| false), 3);
        assert!(initiator.owns(6));
        assert!(!initiator.owns(7));
        assert!(!responder.owns(0));
    }

    #[test]
    fn test_allocator_skips_ids_in_use() {
        let alloc = LineIdAllocator::new(false);
        let used: HashSet<u32> = [1, 3, 5].into_iter().collect();
        assert_eq!(alloc.next(|id| used.contains(&id)), 7);
    }

    #[test]
    fn test_allocator_wraps_below_2_31() {
        let alloc = LineIdAllocator::new(true);
        alloc.counter.store(LINE_ID_SLOTS - 1, Ordering::SeqCst);
        let last = alloc.next(|_| false);
        assert!(last < 1 << 31);
        assert_eq!(alloc.next(|_| false), 2);
    }

    #[test]
    fn test_allocator_unique_across_threads() {
        let alloc = Arc::new(LineIdAllocator::new(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..1000).map(|_| alloc.next(|_| false)).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id % 2, 0);
                assert!(seen.insert(id), "duplicate line id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    proptest! {
        #[test]
        fn prop_allocator_respects_parity(initiator in any::<bool>(), start in 0u32..LINE_ID_SLOTS) {
            let alloc = LineIdAllocator::new(initiator);
            alloc.counter.store(start, Ordering::SeqCst);
            let id = alloc.next(|_| false);
            prop_assert!(id != 0);
            prop_assert!(id < 1 << 31);
            prop_assert_eq!(id % 2 == 0, initiator);
        }
    }
}
