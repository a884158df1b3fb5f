use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::LogFormat;

/// dswarm: a peer-to-peer caching proxy for Debian-family package
/// managers. Point APT at the listen address; packages are served from
/// the local cache, the swarm, or the upstream mirror.
#[derive(Parser, Debug)]
#[command(name = "dswarm", version, about)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "DSWARM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the APT-facing proxy listens on.
    #[arg(long, env = "DSWARM_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Address the peer transfer service listens on.
    #[arg(long, env = "DSWARM_PEER_LISTEN_ADDR")]
    pub peer_listen_addr: Option<SocketAddr>,

    /// Serve /health, /metrics and /stats on a separate address.
    #[arg(long, env = "DSWARM_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Explicitly allow a non-localhost metrics address.
    #[arg(long)]
    pub metrics_bind: bool,

    /// Directory for identity keys and partial-download state.
    #[arg(long, env = "DSWARM_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}
