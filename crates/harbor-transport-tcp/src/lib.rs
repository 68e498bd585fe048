//! TCP ship implementation
//!
//! The minimal transport adapter for relays: a dialer with a connect deadline,
//! and a listener that tells crane traffic apart from HTTP probes and stray
//! clients. Anything that is not a crane gets an answer and is closed:
//!
//! - HTTP requests receive a plain-text info page
//! - silence past the first-read deadline, or unknown bytes, receive the banner

pub mod config;
pub mod listener;
pub mod ship;

pub use config::TcpShipConfig;
pub use listener::{classify_first_bytes, FirstContact, TcpShipConnector, TcpShipListener};
pub use ship::TcpShip;
