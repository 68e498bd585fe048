//! Serving the API on lines opened by peers

use crate::api::Api;
use crate::handlers::HandlerRegistry;
use harbor_crane::{Conveyor, Crane, CraneError, CraneResult, LineAcceptor, LineEnd, TinkerConveyor};
use harbor_proto::Initializer;
use harbor_tinker::KeyRing;
use std::sync::Arc;
use tracing::debug;

/// Accepts lines addressed to this relay and runs an [`Api`] on each.
///
/// Lines carrying an initializer get a tinker conveyor answered with the
/// relay's exchange keys.
pub struct ApiAcceptor {
    relay_id: String,
    keys: KeyRing,
    handlers: Arc<HandlerRegistry>,
    require_encryption: bool,
}

impl ApiAcceptor {
    pub fn new(relay_id: impl Into<String>, keys: KeyRing, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            relay_id: relay_id.into(),
            keys,
            handlers,
            require_encryption: false,
        }
    }

    /// Refuse lines without an end-to-end handshake
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }
}

impl LineAcceptor for ApiAcceptor {
    fn prepare(&self, init: Option<&Initializer>) -> CraneResult<Vec<Box<dyn Conveyor>>> {
        let Some(init) = init else {
            if self.require_encryption {
                return Err(CraneError::LineRejected("encryption required".into()));
            }
            return Ok(Vec::new());
        };

        if init.dest_relay != self.relay_id {
            return Err(CraneError::LineRejected(format!(
                "line addressed to {}",
                init.dest_relay
            )));
        }
        let tinker = TinkerConveyor::respond(init, &self.keys)?;
        Ok(vec![Box::new(tinker)])
    }

    fn serve(&self, crane: &Arc<Crane>, line_id: u32, end: LineEnd) {
        debug!(crane_id = %crane.id(), line_id, "Serving API on line");
        Api::start(end, false, self.handlers.clone());
    }
}
