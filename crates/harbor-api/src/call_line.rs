//! Lines carried inside a hop call

use crate::api::Api;
use crate::error::{ApiError, ApiResult};
use crate::handlers::{handler_id, hop_payload};
use crate::splice::splice;
use harbor_crane::LineEnd;
use harbor_proto::{ApiMsgType, Initializer};
use std::time::Duration;
use tracing::debug;

/// How long the relay may take to set up the next hop
pub const HOP_TIMEOUT: Duration = Duration::from_secs(10);

const LINK_DEPTH: usize = 8;

/// Client side of a hop: a line end backed by a call on another API
pub struct CallLine;

impl CallLine {
    /// Ask the relay behind `api` to open a line to `relay_id` and return its
    /// end. `init` is forwarded to the destination for end-to-end encryption.
    pub async fn open(api: &Api, relay_id: &str, init: Option<&Initializer>) -> ApiResult<LineEnd> {
        let mut call = api
            .call(handler_id::HOP, hop_payload(relay_id, init))
            .await?;

        let msg = match call.recv_timeout(HOP_TIMEOUT).await {
            Ok(msg) => msg,
            Err(e) => {
                call.end().await;
                return Err(e);
            }
        };
        match msg.msg_type {
            ApiMsgType::Data => {}
            ApiMsgType::Err => {
                let err = msg.into_result().err().unwrap_or(ApiError::Ended);
                call.end().await;
                return Err(err);
            }
            _ => return Err(ApiError::Ended),
        }
        debug!(call_id = call.id(), relay_id, "Hop line open");

        let (app, spliced) = LineEnd::pair(LINK_DEPTH);
        tokio::spawn(splice(call, spliced));
        Ok(app)
    }
}
