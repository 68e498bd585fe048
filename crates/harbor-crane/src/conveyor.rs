//! Conveyor links between a line and its application
//!
//! A line's pipeline is a chain of conveyors, each running as its own task:
//!
//! ```text
//!   crane side                                              application side
//!  ┌──────────┐  inbound  ┌──────────┐  inbound  ┌──────────┐
//!  │   line   │ ────────> │ conveyor │ ────────> │ LineEnd  │
//!  │ handler/ │           │  (link)  │           │  (app)   │
//!  │dispatcher│ <──────── │          │ <──────── │          │
//!  └──────────┘ outbound  └──────────┘ outbound  └──────────┘
//! ```
//!
//! Every queue carries [`StreamEvent`]s so that the end of a stream and errors
//! travel in band, in order with the data.

use crate::error::CraneError;
use async_trait::async_trait;
use harbor_proto::Container;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Item on any queue inside a line
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Container),
    /// The sending side is done; nothing follows
    End,
    /// The sending side failed; nothing follows
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Data(_))
    }
}

/// One end of a bidirectional event pipe
#[derive(Debug)]
pub struct LineEnd {
    pub tx: mpsc::Sender<StreamEvent>,
    pub rx: mpsc::Receiver<StreamEvent>,
}

impl LineEnd {
    /// Create two connected ends; what one sends, the other receives
    pub fn pair(depth: usize) -> (LineEnd, LineEnd) {
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        (
            LineEnd { tx: a_tx, rx: b_rx },
            LineEnd { tx: b_tx, rx: a_rx },
        )
    }

    pub async fn send(&self, c: Container) -> Result<(), CraneError> {
        self.tx
            .send(StreamEvent::Data(c))
            .await
            .map_err(|_| CraneError::Stopped)
    }

    /// Signal the end of the outgoing stream
    pub async fn close(&self) {
        let _ = self.tx.send(StreamEvent::End).await;
    }

    /// Next incoming event; a dropped peer reads as [`StreamEvent::End`]
    pub async fn recv(&mut self) -> StreamEvent {
        self.rx.recv().await.unwrap_or(StreamEvent::End)
    }

    pub fn into_split(self) -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
        (self.tx, self.rx)
    }
}

/// A transformation stage inside a line
#[async_trait]
pub trait Conveyor: Send + 'static {
    fn name(&self) -> &'static str;

    /// Transform a container travelling from the ship towards the application
    async fn inbound(&mut self, c: Container) -> Result<Container, CraneError>;

    /// Transform a container travelling from the application towards the ship
    async fn outbound(&mut self, c: Container) -> Result<Container, CraneError>;
}

/// Put `conveyors` in front of `ship_side`, first conveyor closest to the ship.
///
/// Returns the end the application should use.
pub fn chain(ship_side: LineEnd, conveyors: Vec<Box<dyn Conveyor>>, depth: usize) -> LineEnd {
    let mut current = ship_side;
    for conveyor in conveyors {
        let (link_shore, next) = LineEnd::pair(depth);
        tokio::spawn(run_link(conveyor, current, link_shore));
        current = next;
    }
    current
}

async fn run_link(mut conveyor: Box<dyn Conveyor>, ship: LineEnd, shore: LineEnd) {
    let name = conveyor.name();
    let (to_ship, mut from_ship) = ship.into_split();
    let (to_shore, mut from_shore) = shore.into_split();
    let mut inbound_open = true;
    let mut outbound_open = true;

    while inbound_open || outbound_open {
        tokio::select! {
            event = from_ship.recv(), if inbound_open => {
                match event.unwrap_or(StreamEvent::End) {
                    StreamEvent::Data(c) => match conveyor.inbound(c).await {
                        Ok(c) => {
                            if to_shore.send(StreamEvent::Data(c)).await.is_err() {
                                inbound_open = false;
                            }
                        }
                        Err(e) => {
                            fail_both(name, &e, &to_ship, &to_shore).await;
                            return;
                        }
                    },
                    other => {
                        trace!(conveyor = name, "Inbound stream finished");
                        let _ = to_shore.send(other).await;
                        inbound_open = false;
                    }
                }
            }
            event = from_shore.recv(), if outbound_open => {
                match event.unwrap_or(StreamEvent::End) {
                    StreamEvent::Data(c) => match conveyor.outbound(c).await {
                        Ok(c) => {
                            if to_ship.send(StreamEvent::Data(c)).await.is_err() {
                                outbound_open = false;
                            }
                        }
                        Err(e) => {
                            fail_both(name, &e, &to_ship, &to_shore).await;
                            return;
                        }
                    },
                    other => {
                        trace!(conveyor = name, "Outbound stream finished");
                        let _ = to_ship.send(other).await;
                        outbound_open = false;
                    }
                }
            }
        }
    }
}

async fn fail_both(
    name: &'static str,
    error: &CraneError,
    to_ship: &mpsc::Sender<StreamEvent>,
    to_shore: &mpsc::Sender<StreamEvent>,
) {
    debug!(conveyor = name, error = %error, "Conveyor failed");
    let message = error.to_string();
    let _ = to_ship.send(StreamEvent::Error(message.clone())).await;
    let _ = to_shore.send(StreamEvent::Error(message)).await;
}
