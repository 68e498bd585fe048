//! Calls: request/reply exchanges multiplexed over one line

use crate::api::ApiInner;
use crate::error::{ApiError, ApiResult};
use bytes::Bytes;
use harbor_proto::{ApiFrame, ApiMsgType, Container};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message received on a call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiMsg {
    pub msg_type: ApiMsgType,
    pub payload: Container,
}

impl ApiMsg {
    pub fn new(msg_type: ApiMsgType, payload: Container) -> Self {
        Self { msg_type, payload }
    }

    pub fn is_err(&self) -> bool {
        self.msg_type == ApiMsgType::Err
    }

    /// Payload of a successful message; `ERR` frames become [`ApiError`]s
    pub fn into_result(mut self) -> ApiResult<Container> {
        if self.is_err() {
            let raw = self.payload.get_all();
            return Err(ApiError::from_remote(&String::from_utf8_lossy(&raw)));
        }
        Ok(self.payload)
    }

    /// Whole payload as one buffer
    pub fn data(&mut self) -> Bytes {
        self.payload.compile_data()
    }
}

/// Sending half of a call
#[derive(Clone)]
pub struct CallSender {
    id: u32,
    initiator: bool,
    api: Arc<ApiInner>,
}

impl fmt::Debug for CallSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSender")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .finish()
    }
}

impl CallSender {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this side started the call
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_ended(&self) -> bool {
        !self.api.has_call(self.id)
    }

    /// Send a frame on the call. Fails once the call has ended.
    pub async fn send(&self, msg_type: ApiMsgType, payload: Container) -> ApiResult<()> {
        if self.is_ended() {
            return Err(ApiError::Ended);
        }
        self.api
            .send_frame(ApiFrame::new(self.id, msg_type, payload))
            .await
    }

    pub async fn send_data(&self, payload: Container) -> ApiResult<()> {
        self.send(ApiMsgType::Data, payload).await
    }

    /// Report an error; the call stays open
    pub async fn send_err(&self, err: &ApiError) -> ApiResult<()> {
        self.send(ApiMsgType::Err, Container::from_bytes(err.to_wire()))
            .await
    }

    /// Acknowledge and end the call
    pub async fn send_ack(&self, payload: Container) -> ApiResult<()> {
        let sent = self.send(ApiMsgType::Ack, payload).await;
        self.api.end_call(self.id);
        sent
    }

    /// End the call silently. Idempotent.
    pub async fn end(&self) {
        if self.api.end_call(self.id) {
            let frame = ApiFrame::new(self.id, ApiMsgType::End, Container::new());
            let _ = self.api.send_frame(frame).await;
        }
    }
}

/// Receiving half of a call
#[derive(Debug)]
pub struct CallReceiver {
    id: u32,
    msgs: mpsc::Receiver<ApiMsg>,
}

impl CallReceiver {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next message, or `None` once the call is over
    pub async fn recv(&mut self) -> Option<ApiMsg> {
        self.msgs.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> ApiResult<ApiMsg> {
        match tokio::time::timeout(timeout, self.msgs.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(ApiError::Ended),
            Err(_) => Err(ApiError::Timeout("call message")),
        }
    }
}

/// One call on an [`Api`](crate::Api)
#[derive(Debug)]
pub struct Call {
    sender: CallSender,
    receiver: CallReceiver,
}

impl Call {
    pub(crate) fn new(
        id: u32,
        initiator: bool,
        api: Arc<ApiInner>,
        msgs: mpsc::Receiver<ApiMsg>,
    ) -> Self {
        Self {
            sender: CallSender { id, initiator, api },
            receiver: CallReceiver { id, msgs },
        }
    }

    pub fn id(&self) -> u32 {
        self.sender.id
    }

    pub fn is_initiator(&self) -> bool {
        self.sender.initiator
    }

    pub fn is_ended(&self) -> bool {
        self.sender.is_ended()
    }

    pub fn sender(&self) -> CallSender {
        self.sender.clone()
    }

    pub fn into_split(self) -> (CallSender, CallReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn send(&self, msg_type: ApiMsgType, payload: Container) -> ApiResult<()> {
        self.sender.send(msg_type, payload).await
    }

    pub async fn send_data(&self, payload: Container) -> ApiResult<()> {
        self.sender.send_data(payload).await
    }

    pub async fn send_err(&self, err: &ApiError) -> ApiResult<()> {
        self.sender.send_err(err).await
    }

    pub async fn send_ack(&self, payload: Container) -> ApiResult<()> {
        self.sender.send_ack(payload).await
    }

    pub async fn end(&self) {
        self.sender.end().await
    }

    pub async fn recv(&mut self) -> Option<ApiMsg> {
        self.receiver.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> ApiResult<ApiMsg> {
        self.receiver.recv_timeout(timeout).await
    }

    /// Wait for the reply to a request: the first `DATA` or `ACK` payload,
    /// or the error from an `ERR` frame
    pub async fn reply(&mut self, timeout: Duration) -> ApiResult<Container> {
        let msg = self.recv_timeout(timeout).await?;
        match msg.msg_type {
            ApiMsgType::End => Err(ApiError::Ended),
            _ => msg.into_result(),
        }
    }
}
