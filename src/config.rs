use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6881;

/// Knobs for one session. Everything has a sensible default, the CLI only overrides a few.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub download_dir: PathBuf,

    /// Connections plus pending dials never go above this
    pub max_connections: usize,
    /// Peers we keep unchoked at once
    pub max_uploaders: usize,
    /// Outstanding requests per connection
    pub pipeline: usize,

    pub choke_interval: Duration,
    pub monitor_interval: Duration,

    /// How long the tracker client naps between deciding whether to poll
    pub tracker_sleep: Duration,
    /// Interval handed out by the embedded tracker
    pub tracker_interval: Duration,
    pub initial_announce_attempts: usize,

    /// Bounded wait for each step of the shutdown sequence
    pub shutdown_grace: Duration,

    /// Piece size for content we create ourselves
    pub piece_size: u32,
}

impl Config {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Config {
            listen_addr,
            download_dir: PathBuf::from("."),
            max_connections: 24,
            max_uploaders: 4,
            pipeline: 5,
            choke_interval: Duration::from_secs(20),
            monitor_interval: Duration::from_secs(10),
            tracker_sleep: Duration::from_secs(60),
            tracker_interval: Duration::from_secs(300),
            initial_announce_attempts: 5,
            shutdown_grace: Duration::from_secs(5),
            piece_size: 256 * 1024,
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_port(DEFAULT_PORT)
    }
}
