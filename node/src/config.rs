//! Node configuration: TOML file with serde defaults, overridable from
//! the command line.

use std::fs;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use dsc_peer_manager::RateLimitConfig;

use crate::cli::Cli;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON when stdout is not a terminal, text otherwise.
    Auto,
    Text,
    Json,
}

impl LogFormat {
    pub fn resolve(self) -> LogFormat {
        match self {
            LogFormat::Auto => {
                if std::io::stdout().is_terminal() {
                    LogFormat::Text
                } else {
                    LogFormat::Json
                }
            }
            other => other,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub global_limit: u64,
    pub per_peer_limit: u64,
    pub expected_peers: u32,
    pub min_peer_limit: u64,
    pub adaptive_enabled: bool,
    pub max_boost_factor: f64,
    pub latency_threshold_ms: f64,
    pub idle_timeout_secs: u64,
    pub adaptive_recalc_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            global_limit: defaults.global_limit,
            per_peer_limit: defaults.per_peer_limit,
            expected_peers: defaults.expected_peers,
            min_peer_limit: defaults.min_peer_limit,
            adaptive_enabled: defaults.adaptive_enabled,
            max_boost_factor: defaults.max_boost_factor,
            latency_threshold_ms: defaults.latency_threshold_ms,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            adaptive_recalc_interval_secs: defaults.adaptive_recalc_interval.as_secs(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            global_limit: self.global_limit,
            per_peer_limit: self.per_peer_limit,
            expected_peers: self.expected_peers,
            min_peer_limit: self.min_peer_limit,
            adaptive_enabled: self.adaptive_enabled,
            max_boost_factor: self.max_boost_factor,
            latency_threshold_ms: self.latency_threshold_ms,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            adaptive_recalc_interval: Duration::from_secs(self.adaptive_recalc_interval_secs),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub peer_listen_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub metrics_bind: bool,
    pub state_dir: PathBuf,
    pub p2p_timeout_secs: u64,
    pub mirror_timeout_secs: u64,
    pub dht_lookup_limit: usize,
    pub max_peer_sources: usize,
    pub max_response_size: u64,
    pub max_transfer_size: u64,
    pub max_concurrent_uploads: usize,
    pub max_uploads_per_peer: usize,
    pub chunk_size: u64,
    pub max_concurrent_chunks: usize,
    pub peer_allowlist: Vec<String>,
    pub peer_blocklist: Vec<String>,
    pub extra_allowed_hosts: Vec<String>,
    pub allow_loopback_mirrors: bool,
    pub allow_private_peer_addrs: bool,
    pub resume_downloads: bool,
    pub log_format: LogFormat,
    pub rate_limits: RateLimitSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3142".parse().expect("static address"),
            peer_listen_addr: "0.0.0.0:9977".parse().expect("static address"),
            metrics_addr: None,
            metrics_bind: false,
            state_dir: PathBuf::from("./dswarm-state"),
            p2p_timeout_secs: 5,
            mirror_timeout_secs: 60,
            dht_lookup_limit: 20,
            max_peer_sources: 5,
            max_response_size: 500 * 1024 * 1024,
            max_transfer_size: 500 * 1024 * 1024,
            max_concurrent_uploads: 20,
            max_uploads_per_peer: 4,
            chunk_size: 1024 * 1024,
            max_concurrent_chunks: 8,
            peer_allowlist: Vec::new(),
            peer_blocklist: Vec::new(),
            extra_allowed_hosts: Vec::new(),
            allow_loopback_mirrors: false,
            allow_private_peer_addrs: false,
            resume_downloads: false,
            log_format: LogFormat::Auto,
            rate_limits: RateLimitSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Command-line flags win over the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(addr) = cli.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addr) = cli.peer_listen_addr {
            self.peer_listen_addr = addr;
        }
        if let Some(addr) = cli.metrics_addr {
            self.metrics_addr = Some(addr);
        }
        if cli.metrics_bind {
            self.metrics_bind = true;
        }
        if let Some(dir) = &cli.state_dir {
            self.state_dir = dir.clone();
        }
        if let Some(format) = cli.log_format {
            self.log_format = format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(addr) = self.metrics_addr {
            if !addr.ip().is_loopback() && !self.metrics_bind {
                return Err(ConfigError::Invalid(format!(
                    "metrics_addr {addr} is not localhost; pass --metrics-bind to expose it"
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_chunks must be positive".into(),
            ));
        }
        if self.rate_limits.expected_peers == 0 {
            return Err(ConfigError::Invalid(
                "rate_limits.expected_peers must be positive".into(),
            ));
        }
        for entry in self.peer_allowlist.iter().chain(&self.peer_blocklist) {
            if entry.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "peer allow/blocklist entries must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn private_swarm(&self) -> bool {
        !self.peer_allowlist.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_a_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dswarm.toml");
        fs::write(
            &path,
            r#"
listen_addr = "0.0.0.0:3142"
chunk_size = 524288
extra_allowed_hosts = ["apt.internal.example"]

[rate_limits]
global_limit = 1048576
adaptive_enabled = true
"#,
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3142".parse().unwrap());
        assert_eq!(config.chunk_size, 524288);
        assert_eq!(config.extra_allowed_hosts, vec!["apt.internal.example"]);
        assert_eq!(config.rate_limits.global_limit, 1048576);
        assert!(config.rate_limits.adaptive_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_uploads_per_peer, 4);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dswarm.toml");
        fs::write(&path, "no_such_option = true\n").unwrap();
        assert!(matches!(
            Config::load(Some(path.as_path())),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn non_localhost_metrics_requires_explicit_bind() {
        let mut config = Config::default();
        config.metrics_addr = Some("0.0.0.0:9100".parse().unwrap());
        assert!(config.validate().is_err());
        config.metrics_bind = true;
        config.validate().unwrap();
    }

    #[test]
    fn private_swarm_follows_the_allowlist() {
        let mut config = Config::default();
        assert!(!config.private_swarm());
        config.peer_allowlist = vec!["abc123".into()];
        assert!(config.private_swarm());
    }
}
