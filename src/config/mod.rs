//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::util::time::{DEFAULT_SIMULATION_TPS, DEFAULT_SNAPSHOT_TPS};

/// Which side of the session this node plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// Accepts connections from joiners
    Host,
    /// Dials the peers handed over by matchmaking
    Join,
}

impl FromStr for SessionRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "join" => Ok(Self::Join),
            _ => Err(ConfigError::Invalid("SESSION_ROLE")),
        }
    }
}

/// Node configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Reliable channel (TCP) bind address
    pub peer_addr: SocketAddr,
    /// Unreliable channel (UDP) bind address
    pub peer_udp_addr: SocketAddr,
    /// Local status endpoint
    pub status_addr: SocketAddr,

    pub role: SessionRole,
    /// Room identifier supplied by matchmaking
    pub room_id: String,
    /// Peers to dial in the join role
    pub join_peers: Vec<SocketAddr>,
    pub display_name: String,
    pub max_peers: usize,

    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Snapshots broadcast per second
    pub snapshot_rate: u32,
    /// AI entities spawned when hosting
    pub bot_count: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let peer_addr: SocketAddr = var("PEER_ADDR", "0.0.0.0:7400")
            .parse()
            .map_err(|_| ConfigError::InvalidAddress("PEER_ADDR"))?;

        // UDP sits next to TCP unless told otherwise; an ephemeral TCP port
        // means an ephemeral UDP port too
        let peer_udp_addr = match lookup("PEER_UDP_ADDR") {
            Some(addr) => addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress("PEER_UDP_ADDR"))?,
            None => {
                let port = match peer_addr.port() {
                    0 => 0,
                    p => p.checked_add(1).ok_or(ConfigError::InvalidAddress("PEER_ADDR"))?,
                };
                SocketAddr::new(peer_addr.ip(), port)
            }
        };

        let status_addr = var("STATUS_ADDR", "127.0.0.1:7480")
            .parse()
            .map_err(|_| ConfigError::InvalidAddress("STATUS_ADDR"))?;

        let join_peers = var("JOIN_PEERS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(|_| ConfigError::InvalidAddress("JOIN_PEERS")))
            .collect::<Result<Vec<SocketAddr>, _>>()?;

        let tick_rate: u32 = parse(&var("TICK_RATE", &DEFAULT_SIMULATION_TPS.to_string()), "TICK_RATE")?;
        let snapshot_rate: u32 = parse(&var("SNAPSHOT_RATE", &DEFAULT_SNAPSHOT_TPS.to_string()), "SNAPSHOT_RATE")?;
        if tick_rate == 0 {
            return Err(ConfigError::Invalid("TICK_RATE"));
        }
        if snapshot_rate == 0 || snapshot_rate > tick_rate {
            return Err(ConfigError::Invalid("SNAPSHOT_RATE"));
        }

        let room_id = var("ROOM_ID", "lobby");
        if room_id.trim().is_empty() {
            return Err(ConfigError::Missing("ROOM_ID"));
        }

        Ok(Self {
            log_level: var("LOG_LEVEL", "info"),
            peer_addr,
            peer_udp_addr,
            status_addr,
            role: var("SESSION_ROLE", "host").parse()?,
            room_id,
            join_peers,
            display_name: var("DISPLAY_NAME", "player"),
            max_peers: parse(&var("MAX_PEERS", "8"), "MAX_PEERS")?,
            tick_rate,
            snapshot_rate,
            bot_count: parse(&var("BOT_COUNT", "0"), "BOT_COUNT")?,
        })
    }
}

fn parse<T: FromStr>(value: &str, name: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid(name))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid address format in {0}")]
    InvalidAddress(&'static str),

    #[error("Invalid value for {0}")]
    Invalid(&'static str),
}
