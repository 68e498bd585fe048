//! Engine configuration

use crate::error::{EngineError, EngineResult};
use harbor_crane::CraneConfig;
use harbor_proto::docking::{CLIENT_PORT, RELAY_PORT};
use harbor_tinker::Bottle;
use harbor_transport_tcp::TcpShipConfig;
use harbor_unit::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// What a node does in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Opens routes for local applications; does not serve lines
    #[default]
    Client,
    /// Serves lines and forwards hops for other nodes
    Relay,
}

impl NodeMode {
    /// Where the node listens unless told otherwise
    pub fn default_listen(self) -> SocketAddr {
        match self {
            NodeMode::Client => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), CLIENT_PORT),
            NodeMode::Relay => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), RELAY_PORT),
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Client => f.write_str("client"),
            NodeMode::Relay => f.write_str("relay"),
        }
    }
}

impl FromStr for NodeMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(NodeMode::Client),
            "relay" => Ok(NodeMode::Relay),
            other => Err(EngineError::Config(format!("unknown mode '{}'", other))),
        }
    }
}

/// A relay to dial at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: SocketAddr,
    pub bottle: Bottle,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Node name, reported by the info handler
    pub name: String,
    pub mode: NodeMode,
    /// TCP listen addresses; empty means the mode's default
    pub listen: Vec<SocketAddr>,
    pub peers: Vec<PeerConfig>,
    /// Lifetime of generated exchange keys
    pub key_validity: Duration,
    /// Refuse lines that do not carry an end-to-end handshake
    pub require_encryption: bool,
    /// Answer docking datagrams on the UDP side of each listen address
    pub docking: bool,
    pub crane: CraneConfig,
    pub tcp: TcpShipConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "harbor".to_string(),
            mode: NodeMode::default(),
            listen: Vec::new(),
            peers: Vec::new(),
            key_validity: Duration::from_secs(7 * 24 * 3600),
            require_encryption: false,
            docking: true,
            crane: CraneConfig::default(),
            tcp: TcpShipConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn relay(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: NodeMode::Relay,
            ..Default::default()
        }
    }

    pub fn client(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: NodeMode::Client,
            ..Default::default()
        }
    }

    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen.push(addr);
        self
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn with_crane(mut self, crane: CraneConfig) -> Self {
        self.crane = crane;
        self
    }

    /// Listen addresses after applying the mode default
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        if self.listen.is_empty() {
            vec![self.mode.default_listen()]
        } else {
            self.listen.clone()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("node name must not be empty".into()));
        }
        if self.name.len() > harbor_proto::messages::MAX_RELAY_NAME_LEN {
            return Err(EngineError::Config("node name is too long".into()));
        }
        if self.key_validity.is_zero() {
            return Err(EngineError::Config("key validity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_per_mode() {
        assert_eq!(
            EngineConfig::client("c").listen_addrs(),
            vec!["127.0.0.1:1117".parse().unwrap()]
        );
        assert_eq!(
            EngineConfig::relay("r").listen_addrs(),
            vec!["0.0.0.0:17".parse().unwrap()]
        );
        let custom: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(
            EngineConfig::relay("r").with_listen(custom).listen_addrs(),
            vec![custom]
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Relay".parse::<NodeMode>().unwrap(), NodeMode::Relay);
        assert_eq!("client".parse::<NodeMode>().unwrap(), NodeMode::Client);
        assert!("exit".parse::<NodeMode>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::relay("Port2").validate().is_ok());
        assert!(EngineConfig::relay("  ").validate().is_err());
        let mut config = EngineConfig::relay("Port2");
        config.key_validity = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
