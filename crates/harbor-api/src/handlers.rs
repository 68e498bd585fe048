//! Call handlers and the built-in handler set

use crate::call::Call;
use crate::error::ApiError;
use crate::splice::splice;
use async_trait::async_trait;
use bytes::Bytes;
use harbor_crane::Docks;
use harbor_proto::messages::MAX_RELAY_NAME_LEN;
use harbor_proto::{ApiMsgType, Container, Initializer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// IDs of the built-in handlers
pub mod handler_id {
    pub const TEST: u8 = 0;
    pub const INFO: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const HOP: u8 = 3;
}

/// Serves incoming calls for one handler ID.
///
/// `payload` is the call's initial payload with the handler ID removed. The
/// call is ended once `handle` returns, unless it already was.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, call: Call, payload: Container);
}

/// Handlers by ID, shared by every API on one side
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<u8, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test, info and echo handlers, plus hop when `docks` is given
    pub fn builtin(node_name: impl Into<String>, docks: Option<Arc<Docks>>) -> Self {
        let mut registry = Self::new()
            .with(handler_id::TEST, TestHandler)
            .with(handler_id::INFO, InfoHandler::new(node_name))
            .with(handler_id::ECHO, EchoHandler);
        if let Some(docks) = docks {
            registry.insert(handler_id::HOP, HopHandler::new(docks));
        }
        registry
    }

    pub fn with(mut self, id: u8, handler: impl Handler + 'static) -> Self {
        self.insert(id, handler);
        self
    }

    pub fn insert(&mut self, id: u8, handler: impl Handler + 'static) {
        self.handlers.insert(id, Arc::new(handler));
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Replies with the message type named by the first payload byte
pub struct TestHandler;

#[async_trait]
impl Handler for TestHandler {
    async fn handle(&self, mut call: Call, mut payload: Container) {
        let requested = payload
            .get_u8()
            .ok()
            .and_then(|t| ApiMsgType::try_from(t).ok());

        let reply = Container::from_bytes("test");
        match requested {
            Some(ApiMsgType::Ack) => {
                let _ = call.send_ack(reply).await;
            }
            Some(ApiMsgType::End) => call.end().await,
            Some(msg_type @ (ApiMsgType::Data | ApiMsgType::Err)) => {
                if call.send(msg_type, reply).await.is_err() {
                    return;
                }
                // stay open until the caller is done
                while let Some(msg) = call.recv().await {
                    if msg.msg_type.ends_call() {
                        break;
                    }
                }
            }
            Some(ApiMsgType::Call) | None => {
                let err = ApiError::Protocol("test call needs a reply type".into());
                let _ = call.send_err(&err).await;
            }
        }
    }
}

/// Replies `name=<node name>`
pub struct InfoHandler {
    name: String,
}

impl InfoHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Handler for InfoHandler {
    async fn handle(&self, call: Call, _payload: Container) {
        let _ = call
            .send_ack(Container::from_bytes(format!("name={}", self.name)))
            .await;
    }
}

/// Replies with the payload reversed
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, call: Call, mut payload: Container) {
        let mut data = payload.get_all().to_vec();
        data.reverse();
        let _ = call.send_ack(Container::from_bytes(data)).await;
    }
}

/// Decides which relays a hop may lead to
pub trait HopPolicy: Send + Sync {
    fn allow(&self, relay_id: &str) -> bool;
}

/// Allows every hop
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl HopPolicy for AllowAll {
    fn allow(&self, _relay_id: &str) -> bool {
        true
    }
}

impl<F> HopPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn allow(&self, relay_id: &str) -> bool {
        self(relay_id)
    }
}

/// Build the initial payload of a hop call
pub fn hop_payload(relay_id: &str, init: Option<&Initializer>) -> Container {
    let mut c = Container::new();
    c.append_as_block(Bytes::copy_from_slice(relay_id.as_bytes()));
    if let Some(init) = init {
        c.append_container(init.encode());
    }
    c
}

fn parse_hop(mut payload: Container) -> Result<(String, Option<Initializer>), ApiError> {
    let name = payload.get_next_block_limited(MAX_RELAY_NAME_LEN)?;
    let relay_id = String::from_utf8(name.to_vec())
        .map_err(|_| ApiError::Protocol("relay id is not utf-8".into()))?;
    let init = if payload.is_empty() {
        None
    } else {
        Some(Initializer::decode(&mut payload)?)
    };
    Ok((relay_id, init))
}

/// Opens a line to a docked relay and splices the call onto it.
///
/// On success the caller first receives an empty `DATA` frame; after that
/// `DATA` frames carry the line's containers in both directions.
pub struct HopHandler {
    docks: Arc<Docks>,
    policy: Arc<dyn HopPolicy>,
}

impl HopHandler {
    pub fn new(docks: Arc<Docks>) -> Self {
        Self {
            docks,
            policy: Arc::new(AllowAll),
        }
    }

    pub fn with_policy(mut self, policy: impl HopPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}

#[async_trait]
impl Handler for HopHandler {
    async fn handle(&self, call: Call, payload: Container) {
        let (relay_id, init) = match parse_hop(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = call.send_err(&e).await;
                return;
            }
        };

        if !self.policy.allow(&relay_id) {
            debug!(call_id = call.id(), relay_id = %relay_id, "Hop denied");
            let _ = call
                .send_err(&ApiError::Policy(format!("hop to {}", relay_id)))
                .await;
            return;
        }

        let Some(crane) = self.docks.get(&relay_id) else {
            let _ = call
                .send_err(&ApiError::Temporary(format!("no route to {}", relay_id)))
                .await;
            return;
        };

        let (line_id, end) = match crane.establish_line(init, Vec::new()).await {
            Ok(line) => line,
            Err(e) => {
                let _ = call.send_err(&ApiError::from(e)).await;
                return;
            }
        };

        if call.send_data(Container::new()).await.is_err() {
            end.close().await;
            return;
        }
        info!(call_id = call.id(), relay_id = %relay_id, crane_id = %crane.id(), line_id, "Hop established");
        splice(call, end).await;
        debug!(relay_id = %relay_id, line_id, "Hop closed");
    }
}
