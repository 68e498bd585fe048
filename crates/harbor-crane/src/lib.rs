//! Harbor Crane
//!
//! A crane turns one [`Ship`](harbor_transport::Ship) into an encrypted,
//! multiplexed channel between two adjacent relays:
//!
//! ```text
//!  app ─► LineEnd ─► conveyors ─► line dispatcher ─┐
//!                                                  ├─► loader ─► seal ─► ship
//!  controller (line 0) ──────────── priority ──────┘
//!
//!  ship ─► unloader ─► open ─► shipment reader ─► line handler ─► conveyors ─► app
//! ```
//!
//! Containers are packed into fixed-size shipments, each sealed with the
//! crane's session keys. Lines are flow controlled with credit reported over
//! the controller, and outbound containers are paced by the shared
//! [`Scheduler`](harbor_unit::Scheduler).

pub mod config;
pub mod controller;
pub mod conveyor;
pub mod crane;
pub mod docks;
pub mod error;
pub mod line;
pub mod shipment;
pub mod tinker_conveyor;

pub use config::CraneConfig;
pub use controller::{AnnouncementHandler, LineAcceptor};
pub use conveyor::{chain, Conveyor, LineEnd, StreamEvent};
pub use crane::{Crane, CraneContext, CraneSetup, CraneStatus, LineIdAllocator};
pub use docks::{DockEntry, Docks};
pub use error::{CraneError, CraneResult};
pub use line::{FlowControl, Line};
pub use shipment::{ShipmentReader, ShipmentWriter};
pub use tinker_conveyor::TinkerConveyor;
