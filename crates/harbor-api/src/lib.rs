//! Harbor API
//!
//! Request/reply calls multiplexed over a crane line. Every frame is
//!
//! ```text
//! <varint: call_id> <u8: msg_type> <payload>
//! ```
//!
//! The side that opened the line allocates even call IDs, the other side odd
//! ones. A `CALL` frame names a handler in its first payload byte; `ACK` and
//! `END` finish a call, `ERR` reports an error and leaves it open.
//!
//! The `HOP` handler splices a call onto a line towards another relay, and
//! [`CallLine`] turns such a call back into a line end on the client, so APIs
//! can be stacked hop by hop.

pub mod acceptor;
pub mod api;
pub mod call;
pub mod call_line;
pub mod error;
pub mod handlers;
pub mod splice;

pub use acceptor::ApiAcceptor;
pub use api::Api;
pub use call::{ApiMsg, Call, CallReceiver, CallSender};
pub use call_line::CallLine;
pub use error::{ApiError, ApiResult, TEMPORARY_PREFIX};
pub use handlers::{
    handler_id, hop_payload, AllowAll, EchoHandler, Handler, HandlerRegistry, HopHandler,
    HopPolicy, InfoHandler, TestHandler,
};
pub use splice::splice;
