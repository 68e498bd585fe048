//! Lines: flow-controlled sessions inside a crane

use crate::conveyor::{self, Conveyor, LineEnd, StreamEvent};
use crate::crane::Crane;
use harbor_proto::Container;
use harbor_unit::Scheduler;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const BACKOFF_START: Duration = Duration::from_micros(32);
const BACKOFF_MAX: Duration = Duration::from_millis(100);

/// Credit bookkeeping for the inbound direction of a line.
///
/// `shore_space` is the number of free slots in the line's inbound buffer;
/// `reported` is the credit the peer currently believes it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    shore_cap: i64,
    shore_space: i64,
    reported: i64,
}

impl FlowControl {
    pub fn new(shore_cap: u32) -> Self {
        let cap = shore_cap as i64;
        Self {
            shore_cap: cap,
            shore_space: cap,
            reported: cap,
        }
    }

    pub fn shore_space(&self) -> i64 {
        self.shore_space
    }

    pub fn reported(&self) -> i64 {
        self.reported
    }

    /// A container from the peer took a slot
    pub fn on_inbound(&mut self) -> Option<u32> {
        self.shore_space -= 1;
        self.reported -= 1;
        self.report_below(self.shore_cap / 10)
    }

    /// The application took a container off the buffer
    pub fn on_freed(&mut self) -> Option<u32> {
        self.shore_space = (self.shore_space + 1).min(self.shore_cap);
        self.report_below(self.shore_cap / 2)
    }

    fn report_below(&mut self, watermark: i64) -> Option<u32> {
        if self.reported > watermark || self.shore_space <= 0 {
            return None;
        }
        let delta = self.shore_space - self.reported;
        if delta <= 0 {
            return None;
        }
        self.reported = self.shore_space;
        u32::try_from(delta).ok()
    }
}

/// Why a container could not be handed to a line
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliverError {
    /// The inbound buffer is full; the line must be discarded
    Saturated,
    /// The line is already gone
    Closed,
}

/// A logical session inside a crane
#[derive(Debug)]
pub struct Line {
    id: u32,
    shore_cap: u32,
    crane: Weak<Crane>,
    flow: Mutex<FlowControl>,
    ship_space: AtomicI64,
    from_ship: mpsc::Sender<StreamEvent>,
    closed: CancellationToken,
}

impl Line {
    /// Build a line, start its workers and return it with the application end
    /// of its conveyor chain.
    ///
    /// `ship_space` is the initial credit the peer granted us.
    pub(crate) fn spawn(
        crane: &Arc<Crane>,
        id: u32,
        shore_cap: u32,
        ship_space: u32,
        conveyors: Vec<Box<dyn Conveyor>>,
        scheduler: Scheduler,
        link_depth: usize,
    ) -> (Arc<Line>, LineEnd) {
        let shore_cap = shore_cap.max(1);
        let (from_ship_tx, from_ship_rx) = mpsc::channel(shore_cap as usize + 1);

        let line = Arc::new(Line {
            id,
            shore_cap,
            crane: Arc::downgrade(crane),
            flow: Mutex::new(FlowControl::new(shore_cap)),
            ship_space: AtomicI64::new(ship_space as i64),
            from_ship: from_ship_tx,
            closed: CancellationToken::new(),
        });

        let (crane_side, chain_side) = LineEnd::pair(link_depth);
        let app = conveyor::chain(chain_side, conveyors, link_depth);
        let (to_shore, from_shore) = crane_side.into_split();

        tokio::spawn(run_handler(line.clone(), from_ship_rx, to_shore));
        tokio::spawn(run_dispatcher(line.clone(), from_shore, scheduler));

        debug!(crane_id = %crane.id(), line_id = id, shore_cap, ship_space, "Line created");
        (line, app)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn shore_cap(&self) -> u32 {
        self.shore_cap
    }

    /// Credit the peer has granted us
    pub fn ship_space(&self) -> i64 {
        self.ship_space.load(Ordering::Acquire)
    }

    pub fn flow(&self) -> FlowControl {
        match self.flow.lock() {
            Ok(flow) => flow.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn add_ship_space(&self, delta: u32) {
        self.ship_space.fetch_add(delta as i64, Ordering::AcqRel);
    }

    fn with_flow<T>(&self, f: impl FnOnce(&mut FlowControl) -> T) -> T {
        match self.flow.lock() {
            Ok(mut flow) => f(&mut flow),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Hand an inbound container to the line without waiting.
    ///
    /// Returns a credit report for the peer when one is due.
    pub(crate) fn deliver(&self, c: Container) -> Result<Option<u32>, DeliverError> {
        if self.is_abandoned() {
            return Err(DeliverError::Closed);
        }
        let report = self.with_flow(|flow| flow.on_inbound());
        match self.from_ship.try_send(StreamEvent::Data(c)) {
            Ok(()) => Ok(report),
            Err(TrySendError::Full(_)) => Err(DeliverError::Saturated),
            Err(TrySendError::Closed(_)) => Err(DeliverError::Closed),
        }
    }

    /// Close the line locally: the application sees the end of the stream and
    /// the dispatcher stops. Idempotent.
    pub(crate) fn abandon(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        trace!(line_id = self.id, "Line abandoned");

        match self.from_ship.try_send(StreamEvent::End) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.from_ship.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
        }
    }

    /// Wait until the peer has granted credit. Returns false if the line closed.
    async fn wait_for_ship_space(&self) -> bool {
        let mut backoff = BACKOFF_START;
        while self.ship_space() <= 0 {
            tokio::select! {
                _ = self.closed.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        true
    }
}

/// Moves inbound containers towards the application and returns credit
async fn run_handler(
    line: Arc<Line>,
    mut from_ship: mpsc::Receiver<StreamEvent>,
    to_shore: mpsc::Sender<StreamEvent>,
) {
    while let Some(event) = from_ship.recv().await {
        match event {
            StreamEvent::Data(c) => {
                if to_shore.send(StreamEvent::Data(c)).await.is_err() {
                    break;
                }
                if let Some(delta) = line.with_flow(|flow| flow.on_freed()) {
                    if let Some(crane) = line.crane.upgrade() {
                        crane.report_line_space(line.id, delta);
                    }
                }
            }
            terminal => {
                let _ = to_shore.send(terminal).await;
                break;
            }
        }
    }
    trace!(line_id = line.id, "Line handler finished");
}

/// Sends outbound containers to the crane as credit allows
async fn run_dispatcher(
    line: Arc<Line>,
    mut from_shore: mpsc::Receiver<StreamEvent>,
    scheduler: Scheduler,
) {
    loop {
        let event = tokio::select! {
            _ = line.closed.cancelled() => break,
            event = from_shore.recv() => event.unwrap_or(StreamEvent::End),
        };

        let c = match event {
            StreamEvent::Data(c) => c,
            StreamEvent::End | StreamEvent::Error(_) => {
                if let Some(crane) = line.crane.upgrade() {
                    crane.discard_line(line.id).await;
                }
                break;
            }
        };
        // nothing goes on the wire for an empty container, so it costs no credit
        if c.is_empty() {
            continue;
        }

        if !line.wait_for_ship_space().await {
            break;
        }

        let unit = scheduler.new_unit();
        tokio::select! {
            _ = line.closed.cancelled() => break,
            _ = unit.wait_for_slot() => {}
        }

        let Some(crane) = line.crane.upgrade() else {
            break;
        };
        match crane.dispatch_container(line.id, c).await {
            Ok(true) => {
                line.ship_space.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(false) => {}
            Err(e) => {
                debug!(line_id = line.id, error = %e, "Dispatch failed");
                break;
            }
        }
        unit.finish();
    }
    trace!(line_id = line.id, "Line dispatcher finished");
}
