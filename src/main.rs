//! Harbor hub - run a relay or client node
//!
//! Relays listen for ships, serve lines and forward hops. Clients dial relays
//! and build routes for local applications.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand};
use harbor_lib::proto::DockingSignal;
use harbor_lib::tinker::Bottle;
use harbor_lib::{Engine, EngineConfig, NodeMode, PeerConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("HARBOR_COMMIT"),
    " ",
    env!("HARBOR_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "hub")]
#[command(about = "Harbor hub - privacy overlay relay and client")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "HARBOR_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node until interrupted
    #[command(long_about = r#"
Run a harbor node. Relays accept ships from other nodes and forward hops;
clients only dial out.

EXAMPLES:
  # Relay on the default port
  hub run --name Port2 --mode relay

  # Relay that dials a bootstrap peer
  hub run --name Port3 --mode relay --listen 0.0.0.0:4017 \
    --peer 10.0.0.2:17=<bottle>

  # Settings from a file, name overridden on the command line
  hub run --config hub.yaml --name Port4

ENVIRONMENT VARIABLES:
  HARBOR_NAME     Node name
  HARBOR_MODE     client or relay
  HARBOR_LISTEN   Comma separated listen addresses
  HARBOR_PEERS    Comma separated ADDRESS=BOTTLE pairs
    "#)]
    Run {
        /// YAML settings file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Node name reported to peers
        #[arg(long, env = "HARBOR_NAME")]
        name: Option<String>,

        /// Node mode
        #[arg(long, env = "HARBOR_MODE")]
        mode: Option<NodeMode>,

        /// TCP (and docking UDP) listen addresses
        #[arg(long, env = "HARBOR_LISTEN", value_delimiter = ',')]
        listen: Vec<SocketAddr>,

        /// Bootstrap relays as ADDRESS=BOTTLE, the bottle in base64
        #[arg(long = "peer", env = "HARBOR_PEERS", value_delimiter = ',', value_parser = parse_peer)]
        peers: Vec<PeerConfig>,

        /// Refuse lines without end-to-end encryption
        #[arg(long)]
        require_encryption: bool,

        /// Do not answer docking signals
        #[arg(long)]
        no_docking: bool,
    },

    /// Ask a node for its bottle and print it as a peer entry
    Seagull {
        /// Docking address of the node (its listen address)
        address: SocketAddr,

        /// Seconds to wait for an answer
        #[arg(long, default_value = "3")]
        timeout: u64,

        /// Print the decoded bottle as JSON instead of a peer entry
        #[arg(long)]
        json: bool,
    },
}

/// Settings file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    name: Option<String>,
    mode: Option<NodeMode>,
    listen: Vec<SocketAddr>,
    peers: Vec<FilePeer>,
    require_encryption: bool,
    docking: Option<bool>,
    key_validity_hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePeer {
    address: SocketAddr,
    /// Base64 bottle
    bottle: String,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn decode_bottle(encoded: &str) -> Result<Bottle> {
    let raw = BASE64
        .decode(encoded.trim())
        .context("Bottle is not valid base64")?;
    Bottle::from_bytes(&raw).context("Bottle is malformed")
}

fn encode_bottle(bottle: &Bottle) -> Result<String> {
    Ok(BASE64.encode(bottle.to_bytes()?))
}

fn parse_peer(s: &str) -> Result<PeerConfig> {
    let (address, bottle) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected ADDRESS=BOTTLE"))?;
    Ok(PeerConfig {
        address: address
            .trim()
            .parse()
            .with_context(|| format!("Invalid peer address '{}'", address))?,
        bottle: decode_bottle(bottle)?,
    })
}

/// Combine the settings file with command line flags; flags win
fn build_config(
    file: FileConfig,
    name: Option<String>,
    mode: Option<NodeMode>,
    listen: Vec<SocketAddr>,
    peers: Vec<PeerConfig>,
    require_encryption: bool,
    no_docking: bool,
) -> Result<EngineConfig> {
    let mode = mode.or(file.mode).unwrap_or_default();
    let name = name
        .or(file.name)
        .ok_or_else(|| anyhow!("A node name is required (--name or HARBOR_NAME)"))?;

    let mut config = match mode {
        NodeMode::Relay => EngineConfig::relay(name),
        NodeMode::Client => EngineConfig::client(name),
    };
    config.listen = if listen.is_empty() { file.listen } else { listen };
    for peer in file.peers {
        config.peers.push(PeerConfig {
            address: peer.address,
            bottle: decode_bottle(&peer.bottle)
                .with_context(|| format!("Peer {}", peer.address))?,
        });
    }
    config.peers.extend(peers);
    config.require_encryption = require_encryption || file.require_encryption;
    config.docking = !no_docking && file.docking.unwrap_or(true);
    if let Some(hours) = file.key_validity_hours {
        config.key_validity = Duration::from_secs(hours * 3600);
    }

    config.validate()?;
    Ok(config)
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_node(config: EngineConfig) -> Result<()> {
    let engine = Engine::new(config).context("Failed to create engine")?;
    info!(
        name = %engine.config().name,
        mode = %engine.config().mode,
        relay_id = %engine.relay_id(),
        "Hub starting"
    );
    info!(bottle = %encode_bottle(engine.identity())?, "Identity");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = engine.run() => result.context("Engine stopped"),
    };

    engine.shutdown().await;
    info!("Hub stopped");
    result
}

async fn seagull(address: SocketAddr, wait: Duration, json: bool) -> Result<()> {
    let bind: SocketAddr = if address.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = tokio::net::UdpSocket::bind(bind).await?;
    socket.send_to(&DockingSignal::Seagull.encode(), address).await?;

    let mut buf = vec![0u8; 64 * 1024];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| anyhow!("No answer from {}", address))??;
        if from != address {
            continue;
        }
        let Some(DockingSignal::Bottle(data)) = DockingSignal::parse(&buf[..len]) else {
            warn!(peer = %from, "Unexpected docking answer");
            continue;
        };
        let bottle = Bottle::from_bytes(&data).context("Peer sent a malformed bottle")?;
        if json {
            println!("{}", serde_json::to_string_pretty(&bottle)?);
        } else {
            println!("# {} ({})", bottle.name, bottle.id);
            println!("{}={}", address, BASE64.encode(&data));
        }
        return Ok(());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            name,
            mode,
            listen,
            peers,
            require_encryption,
            no_docking,
        } => {
            let file = match config {
                Some(path) => FileConfig::load(&path)?,
                None => FileConfig::default(),
            };
            let config = build_config(file, name, mode, listen, peers, require_encryption, no_docking)?;
            if let Err(e) = run_node(config).await {
                error!("Hub failed: {:#}", e);
                return Err(e);
            }
            Ok(())
        }
        Commands::Seagull {
            address,
            timeout,
            json,
        } => {
            if timeout == 0 {
                bail!("--timeout must be at least one second");
            }
            seagull(address, Duration::from_secs(timeout), json).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_lib::tinker::KeyRing;
    use std::io::Write;

    fn sample_bottle() -> Bottle {
        let ring = KeyRing::new();
        Bottle::generate("Port2").with_exchange_keys(vec![ring.generate(chrono::Duration::hours(1))])
    }

    #[test]
    fn test_parse_peer() {
        let bottle = sample_bottle();
        let arg = format!("10.0.0.2:17={}", encode_bottle(&bottle).unwrap());
        let peer = parse_peer(&arg).unwrap();
        assert_eq!(peer.address, "10.0.0.2:17".parse().unwrap());
        assert_eq!(peer.bottle, bottle);

        assert!(parse_peer("10.0.0.2:17").is_err());
        assert!(parse_peer("nowhere=abc").is_err());
        assert!(parse_peer("10.0.0.2:17=!!!").is_err());
    }

    #[test]
    fn test_file_config_with_flag_overrides() {
        let bottle = sample_bottle();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: Port3\nmode: relay\nlisten: [\"127.0.0.1:4017\"]\nkey_validity_hours: 2\npeers:\n  - address: 10.0.0.2:17\n    bottle: {}",
            encode_bottle(&bottle).unwrap()
        )
        .unwrap();

        let loaded = FileConfig::load(file.path()).unwrap();
        let config = build_config(
            loaded,
            Some("Port4".into()),
            None,
            Vec::new(),
            Vec::new(),
            false,
            true,
        )
        .unwrap();

        assert_eq!(config.name, "Port4");
        assert_eq!(config.mode, NodeMode::Relay);
        assert_eq!(config.listen, vec!["127.0.0.1:4017".parse().unwrap()]);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].bottle.id, bottle.id);
        assert_eq!(config.key_validity, Duration::from_secs(7200));
        assert!(!config.docking);
    }

    #[test]
    fn test_name_required() {
        let err = build_config(
            FileConfig::default(),
            None,
            None,
            Vec::new(),
            Vec::new(),
            false,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: Port3\ntoken: secret").unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }
}
