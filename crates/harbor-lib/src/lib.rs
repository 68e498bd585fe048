//! Harbor node engine
//!
//! Ties the data plane together: an [`Engine`] owns the node's identity and
//! exchange keys, the docks, the unit scheduler and the call handlers, and
//! runs a crane for every ship it accepts or opens.
//!
//! ```text
//!   client ──ship── relay A ──ship── relay B ──ship── relay C
//!     │                │                │
//!     └─ API (tinker) ─┘                │
//!     └──── hop ─── API (tinker) ───────┘
//!     └──────────── hop ──── API (tinker) ───────────────┘
//! ```
//!
//! Routes are built one hop at a time with [`Engine::open_api`] and
//! [`Engine::hop`]; each hop is encrypted end to end with the destination.

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;

pub use config::{EngineConfig, NodeMode, PeerConfig};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use identity::{validate_bottle, IdentityStore, InMemoryIdentityStore};

pub use harbor_api as api;
pub use harbor_crane as crane;
pub use harbor_proto as proto;
pub use harbor_tinker as tinker;
pub use harbor_transport as transport;
