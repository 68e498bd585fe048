//! In-band crane controller on line 0

use crate::conveyor::{Conveyor, LineEnd};
use crate::crane::{Crane, CraneStatus};
use crate::error::{CraneError, CraneResult};
use async_trait::async_trait;
use bytes::Bytes;
use harbor_proto::{AnnouncementScope, ControllerMsg, Initializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Receives identity announcements arriving over cranes
#[async_trait]
pub trait AnnouncementHandler: Send + Sync {
    /// A peer forwarded an identity announcement
    async fn bottle_update(&self, crane_id: &str, scope: AnnouncementScope, data: Bytes);

    /// A peer asks to publish its identity through this crane.
    ///
    /// Returns the relay ID to dock the crane under, or `None` to refuse.
    async fn verify_publish(&self, crane_id: &str, data: Bytes) -> Option<String>;
}

/// Decides what runs on lines the peer opens
pub trait LineAcceptor: Send + Sync {
    /// Build the conveyors for a requested line, or refuse it
    fn prepare(&self, init: Option<&Initializer>) -> CraneResult<Vec<Box<dyn Conveyor>>>;

    /// Take over the application end of an accepted line
    fn serve(&self, crane: &Arc<Crane>, line_id: u32, end: LineEnd);
}

pub(crate) type LineReply = oneshot::Sender<CraneResult<(u32, LineEnd)>>;

struct PendingLine {
    shore_cap: u32,
    conveyors: Vec<Box<dyn Conveyor>>,
    reply: LineReply,
}

pub(crate) struct Controller {
    pending: Mutex<HashMap<u32, PendingLine>>,
    next_request: AtomicU32,
    publish_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    acceptor: Option<Arc<dyn LineAcceptor>>,
    announcements: Option<Arc<dyn AnnouncementHandler>>,
}

impl Controller {
    pub(crate) fn new(
        acceptor: Option<Arc<dyn LineAcceptor>>,
        announcements: Option<Arc<dyn AnnouncementHandler>>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU32::new(1),
            publish_waiter: Mutex::new(None),
            acceptor,
            announcements,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u32, PendingLine>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a line request and return its ID
    pub(crate) fn add_pending(
        &self,
        shore_cap: u32,
        conveyors: Vec<Box<dyn Conveyor>>,
        reply: LineReply,
    ) -> u32 {
        let request_id = self.next_request.fetch_add(1, Ordering::AcqRel);
        self.pending().insert(
            request_id,
            PendingLine {
                shore_cap,
                conveyors,
                reply,
            },
        );
        request_id
    }

    pub(crate) fn cancel_pending(&self, request_id: u32) {
        self.pending().remove(&request_id);
    }

    pub(crate) fn set_publish_waiter(&self, waiter: oneshot::Sender<bool>) {
        if let Ok(mut slot) = self.publish_waiter.lock() {
            *slot = Some(waiter);
        }
    }

    /// Fail everything that waits on the peer
    pub(crate) fn clear(&self) {
        let pending: Vec<PendingLine> = self.pending().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.reply.send(Err(CraneError::Stopped));
        }
        if let Ok(mut slot) = self.publish_waiter.lock() {
            slot.take();
        }
    }

    /// Act on a controller message from the peer
    pub(crate) fn handle(&self, crane: &Arc<Crane>, msg: ControllerMsg) -> CraneResult<()> {
        match msg {
            ControllerMsg::NewLineRequest {
                request_id,
                shore_cap,
                init,
            } => self.on_line_request(crane, request_id, shore_cap, init),
            ControllerMsg::NewLineResponse {
                request_id,
                line_id,
                shore_cap,
            } => self.on_line_response(crane, request_id, line_id, shore_cap),
            ControllerMsg::NewLineRejected { request_id, reason } => {
                if let Some(p) = self.pending().remove(&request_id) {
                    let _ = p.reply.send(Err(CraneError::LineRejected(reason)));
                }
                Ok(())
            }
            ControllerMsg::LineDiscard { line_id } => {
                crane.close_line(line_id);
                Ok(())
            }
            ControllerMsg::LineSpace { line_id, delta } => {
                if let Some(line) = crane.line(line_id) {
                    line.add_ship_space(delta);
                }
                Ok(())
            }
            ControllerMsg::BottleUpdate { scope, data } => {
                self.on_bottle_update(crane, scope, data);
                Ok(())
            }
            ControllerMsg::Publish { data } => {
                self.on_publish(crane, data);
                Ok(())
            }
            ControllerMsg::PublishAck { accepted } => {
                let waiter = self.publish_waiter.lock().ok().and_then(|mut w| w.take());
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(accepted);
                        Ok(())
                    }
                    None => Err(CraneError::Protocol("unexpected publish ack".into())),
                }
            }
        }
    }

    fn on_line_request(
        &self,
        crane: &Arc<Crane>,
        request_id: u32,
        peer_cap: u32,
        init: Option<Initializer>,
    ) -> CraneResult<()> {
        let prepared = match &self.acceptor {
            Some(acceptor) => acceptor.prepare(init.as_ref()),
            None => Err(CraneError::LineRejected("lines not accepted here".into())),
        };

        let conveyors = match prepared {
            Ok(conveyors) => conveyors,
            Err(e) => {
                debug!(crane_id = %crane.id(), request_id, error = %e, "Refusing line");
                crane.send_controller(ControllerMsg::NewLineRejected {
                    request_id,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let shore_cap = crane.config().default_shore_cap;
        let (line_id, end) = crane.open_line(None, shore_cap, peer_cap, conveyors)?;

        // The response goes out before the application can write to the line
        crane.send_controller(ControllerMsg::NewLineResponse {
            request_id,
            line_id,
            shore_cap,
        });

        if let Some(acceptor) = &self.acceptor {
            acceptor.serve(crane, line_id, end);
        }
        Ok(())
    }

    fn on_line_response(
        &self,
        crane: &Arc<Crane>,
        request_id: u32,
        line_id: u32,
        peer_cap: u32,
    ) -> CraneResult<()> {
        let Some(pending) = self.pending().remove(&request_id) else {
            debug!(crane_id = %crane.id(), request_id, line_id, "Line response for expired request");
            crane.send_controller(ControllerMsg::LineDiscard { line_id });
            return Ok(());
        };

        if !crane.is_peer_line_id(line_id) {
            let _ = pending.reply.send(Err(CraneError::Protocol(format!(
                "peer assigned invalid line id {}",
                line_id
            ))));
            return Err(CraneError::Protocol(format!(
                "peer assigned line id {} from our range",
                line_id
            )));
        }

        match crane.open_line(Some(line_id), pending.shore_cap, peer_cap, pending.conveyors) {
            Ok((line_id, end)) => {
                if let Err(Ok((line_id, _))) = pending.reply.send(Ok((line_id, end))) {
                    // requester gave up in the meantime
                    crane.close_line(line_id);
                    crane.send_controller(ControllerMsg::LineDiscard { line_id });
                }
                Ok(())
            }
            Err(e) => {
                let _ = pending.reply.send(Err(CraneError::Protocol(e.to_string())));
                Err(e)
            }
        }
    }

    fn on_bottle_update(&self, crane: &Arc<Crane>, scope: AnnouncementScope, data: Bytes) {
        if scope == AnnouncementScope::Local {
            debug!(crane_id = %crane.id(), len = data.len(), "Ignoring local bottle update");
            return;
        }
        let Some(handler) = self.announcements.clone() else {
            debug!(crane_id = %crane.id(), "No announcement handler, dropping bottle update");
            return;
        };
        let crane_id = crane.id().to_string();
        tokio::spawn(async move {
            handler.bottle_update(&crane_id, scope, data).await;
        });
    }

    fn on_publish(&self, crane: &Arc<Crane>, data: Bytes) {
        let Some(handler) = self.announcements.clone() else {
            crane.send_controller(ControllerMsg::PublishAck { accepted: false });
            return;
        };

        crane.set_status(CraneStatus::PublishVerifying);
        let crane = crane.clone();
        tokio::spawn(async move {
            let relay_id = handler.verify_publish(crane.id(), data).await;
            let accepted = relay_id.is_some();
            match relay_id {
                Some(relay_id) => {
                    info!(crane_id = %crane.id(), relay_id = %relay_id, "Peer published");
                    crane.set_status(CraneStatus::Published);
                    crane.dock_as(relay_id);
                }
                None => {
                    warn!(crane_id = %crane.id(), "Peer publish refused");
                    crane.set_status(CraneStatus::Private);
                }
            }
            crane.send_controller(ControllerMsg::PublishAck { accepted });
        });
    }
}
