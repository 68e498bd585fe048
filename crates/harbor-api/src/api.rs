//! API base: call table and frame routing for one line

use crate::call::{ApiMsg, Call};
use crate::error::{ApiError, ApiResult};
use crate::handlers::HandlerRegistry;
use harbor_crane::{LineEnd, StreamEvent};
use harbor_proto::{ApiFrame, ApiMsgType, Container};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Call IDs wrap back by this amount, keeping their parity
const CALL_ID_WRAP: u32 = (1 << 31) - 8;

/// Depth of each call's message queue. A call that falls further behind
/// is ended.
pub const CALL_QUEUE_DEPTH: usize = 32;

struct CallTable {
    calls: HashMap<u32, mpsc::Sender<ApiMsg>>,
    next_id: u32,
    abandoned: bool,
    outbound: Option<mpsc::Sender<StreamEvent>>,
}

impl CallTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id += 2;
            if self.next_id >= CALL_ID_WRAP {
                self.next_id -= CALL_ID_WRAP;
            }
            if id != 0 && !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

pub(crate) struct ApiInner {
    initiator: bool,
    table: Mutex<CallTable>,
    handlers: Arc<HandlerRegistry>,
    closed: CancellationToken,
}

impl ApiInner {
    fn table(&self) -> MutexGuard<'_, CallTable> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn has_call(&self, id: u32) -> bool {
        self.table().calls.contains_key(&id)
    }

    /// Remove a call and close its message queue. Returns whether it was
    /// still active.
    pub(crate) fn end_call(&self, id: u32) -> bool {
        self.table().calls.remove(&id).is_some()
    }

    pub(crate) async fn send_frame(&self, frame: ApiFrame) -> ApiResult<()> {
        let outbound = self.table().outbound.clone().ok_or(ApiError::Abandoned)?;
        trace!(call_id = frame.call_id, msg_type = ?frame.msg_type, "API send");
        outbound
            .send(StreamEvent::Data(frame.encode()))
            .await
            .map_err(|_| ApiError::Abandoned)
    }

    fn shutdown(&self) {
        let mut table = self.table();
        if table.abandoned {
            return;
        }
        table.abandoned = true;
        let active = table.calls.len();
        table.calls.clear();
        // dropping the sender ends the line
        table.outbound.take();
        drop(table);

        self.closed.cancel();
        debug!(initiator = self.initiator, active_calls = active, "API shut down");
    }

    async fn dispatch(self: &Arc<Self>, frame: ApiFrame) {
        let ApiFrame {
            call_id,
            msg_type,
            payload,
        } = frame;
        trace!(call_id, msg_type = ?msg_type, "API receive");

        if msg_type == ApiMsgType::Call {
            self.on_new_call(call_id, payload).await;
            return;
        }

        let queue = {
            let mut table = self.table();
            let queue = table.calls.get(&call_id).cloned();
            if msg_type.ends_call() {
                table.calls.remove(&call_id);
            }
            queue
        };
        let Some(queue) = queue else {
            trace!(call_id, "Dropping frame for unknown call");
            return;
        };

        match queue.try_send(ApiMsg::new(msg_type, payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflow(call_id),
            Err(TrySendError::Closed(_)) => {
                // receiver is gone; nobody will read this call again
                self.end_call(call_id);
            }
        }
    }

    /// End a call whose reader fell `CALL_QUEUE_DEPTH` messages behind. The
    /// local side sees the call end after the queued messages; the peer gets
    /// `ERR` then `END`.
    fn overflow(self: &Arc<Self>, call_id: u32) {
        if !self.end_call(call_id) {
            return;
        }
        warn!(call_id, depth = CALL_QUEUE_DEPTH, "Call queue overflowed, ending call");
        let api = self.clone();
        tokio::spawn(async move {
            let err = ApiError::Protocol("call queue overflowed".into());
            for (msg_type, body) in [
                (ApiMsgType::Err, Container::from_bytes(err.to_wire())),
                (ApiMsgType::End, Container::new()),
            ] {
                if api.send_frame(ApiFrame::new(call_id, msg_type, body)).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn on_new_call(self: &Arc<Self>, call_id: u32, mut payload: Container) {
        let handler = payload
            .get_u8()
            .ok()
            .and_then(|id| self.handlers.get(id).map(|h| (id, h)));

        let Some((handler_id, handler)) = handler else {
            debug!(call_id, "No handler for incoming call");
            for (msg_type, body) in [
                (ApiMsgType::Err, Container::from_bytes("no handler")),
                (ApiMsgType::End, Container::new()),
            ] {
                let _ = self.send_frame(ApiFrame::new(call_id, msg_type, body)).await;
            }
            return;
        };

        let (tx, rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        {
            let mut table = self.table();
            if table.abandoned {
                return;
            }
            if table.calls.contains_key(&call_id) {
                warn!(call_id, "Peer reused an active call id");
                return;
            }
            table.calls.insert(call_id, tx);
        }

        let call = Call::new(call_id, false, self.clone(), rx);
        let sender = call.sender();
        debug!(call_id, handler_id, "Incoming call");
        tokio::spawn(async move {
            handler.handle(call, payload).await;
            sender.end().await;
        });
    }
}

/// The API layer on one line.
///
/// Cloning gives another handle to the same call table.
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("initiator", &self.inner.initiator)
            .field("active_calls", &self.active_calls())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

impl Api {
    /// Run the API on a line end. The side that set up the line is the
    /// initiator and uses even call IDs.
    pub fn start(end: LineEnd, initiator: bool, handlers: Arc<HandlerRegistry>) -> Api {
        let (outbound, inbound) = end.into_split();
        let inner = Arc::new(ApiInner {
            initiator,
            table: Mutex::new(CallTable {
                calls: HashMap::new(),
                next_id: if initiator { 2 } else { 1 },
                abandoned: false,
                outbound: Some(outbound),
            }),
            handlers,
            closed: CancellationToken::new(),
        });
        tokio::spawn(run_reader(inner.clone(), inbound));
        Api { inner }
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    /// Start a call to `handler_id` on the other side
    pub async fn call(&self, handler_id: u8, mut payload: Container) -> ApiResult<Call> {
        let (tx, rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        let id = {
            let mut table = self.inner.table();
            if table.abandoned {
                return Err(ApiError::Abandoned);
            }
            let id = table.allocate_id();
            table.calls.insert(id, tx);
            id
        };

        payload.prepend(vec![handler_id]);
        if let Err(e) = self
            .inner
            .send_frame(ApiFrame::new(id, ApiMsgType::Call, payload))
            .await
        {
            self.inner.end_call(id);
            return Err(e);
        }
        debug!(call_id = id, handler_id, "Call started");
        Ok(Call::new(id, true, self.inner.clone(), rx))
    }

    /// Forget a call without telling the peer
    pub fn end_call(&self, id: u32) {
        self.inner.end_call(id);
    }

    pub fn active_calls(&self) -> usize {
        self.inner.table().calls.len()
    }

    /// Close every call and the line. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Wait until the API has shut down
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

async fn run_reader(api: Arc<ApiInner>, mut inbound: mpsc::Receiver<StreamEvent>) {
    loop {
        let event = tokio::select! {
            _ = api.closed.cancelled() => break,
            event = inbound.recv() => event.unwrap_or(StreamEvent::End),
        };
        match event {
            StreamEvent::Data(c) => match ApiFrame::decode(c) {
                Ok(frame) => api.dispatch(frame).await,
                Err(e) => warn!(error = %e, "Dropping malformed API frame"),
            },
            StreamEvent::End => break,
            StreamEvent::Error(e) => {
                debug!(error = %e, "Line failed under API");
                break;
            }
        }
    }
    api.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(initiator: bool) -> CallTable {
        CallTable {
            calls: HashMap::new(),
            next_id: if initiator { 2 } else { 1 },
            abandoned: false,
            outbound: None,
        }
    }

    #[test]
    fn test_call_id_parity() {
        let mut even = table(true);
        let mut odd = table(false);
        assert_eq!(even.allocate_id(), 2);
        assert_eq!(even.allocate_id(), 4);
        assert_eq!(odd.allocate_id(), 1);
        assert_eq!(odd.allocate_id(), 3);
    }

    #[test]
    fn test_call_id_wraps_and_skips_active() {
        let mut t = table(false);
        t.next_id = CALL_ID_WRAP - 1;
        assert_eq!(t.allocate_id(), CALL_ID_WRAP - 1);
        // wrapped back by CALL_ID_WRAP, staying odd
        assert_eq!(t.next_id, 1);

        let (tx, _rx) = mpsc::channel(1);
        t.calls.insert(1, tx);
        assert_eq!(t.allocate_id(), 3);
    }

    #[test]
    fn test_initiator_never_gets_zero() {
        let mut t = table(true);
        t.next_id = CALL_ID_WRAP - 2;
        assert_eq!(t.allocate_id(), CALL_ID_WRAP - 2);
        assert_eq!(t.allocate_id(), 2);
    }
}
