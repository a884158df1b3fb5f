//! Peer scoring and provider ranking.
//!
//! Tracks per-peer success, latency and throughput aggregates, ranks
//! provider candidates for the downloader, and blacklists peers on proof
//! of misbehavior (hash mismatches, protocol violations).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use dsc_common::{PeerId, PeerInfo};

const LOG_TARGET: &str = "peer-scorer";

/// Throughput that counts as "fast" when normalizing scores.
const THROUGHPUT_NORM_BPS: f64 = 10.0 * 1024.0 * 1024.0;

/// Bounded ranking boost for peers found on the local network.
const MDNS_BOOST: f64 = 0.1;

#[derive(Clone, Debug)]
pub struct ScorerConfig {
    /// Peers unseen for longer than this are dropped by [`PeerScorer::cleanup`].
    pub idle_window: Duration,
    /// Largest fraction of a selection that may share one /24 (IPv4) or
    /// /48 (IPv6) block.
    pub max_same_block_fraction: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(24 * 3600),
            max_same_block_fraction: 0.5,
        }
    }
}

/// Aggregate state for one peer.
#[derive(Clone, Debug)]
pub struct PeerScore {
    pub peer_id: PeerId,
    pub success_count: u64,
    pub failure_count: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub avg_latency_ms: f64,
    pub avg_throughput_bps: f64,
    pub last_seen: Instant,
    pub blacklisted_until: Option<Instant>,
    pub blacklist_reason: Option<String>,
    pub mdns_discovered: bool,
    latency_samples: u64,
    throughput_samples: u64,
}

impl PeerScore {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            success_count: 0,
            failure_count: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            avg_latency_ms: 0.0,
            avg_throughput_bps: 0.0,
            last_seen: Instant::now(),
            blacklisted_until: None,
            blacklist_reason: None,
            mdns_discovered: false,
            latency_samples: 0,
            throughput_samples: 0,
        }
    }

    fn blacklist_active(&self) -> bool {
        match self.blacklisted_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Composite score in `[0, 1]`; zero while blacklisted.
    pub fn score(&self) -> f64 {
        if self.blacklist_active() {
            return 0.0;
        }
        let attempts = self.success_count + self.failure_count;
        let success_ratio = if attempts == 0 {
            // Unknown peers rank below proven ones but above failing ones.
            0.5
        } else {
            self.success_count as f64 / attempts as f64
        };
        let throughput = (self.avg_throughput_bps / THROUGHPUT_NORM_BPS).min(1.0);
        let latency = if self.latency_samples == 0 {
            0.5
        } else {
            1.0 / (1.0 + self.avg_latency_ms / 200.0)
        };
        let mut score = 0.5 * success_ratio + 0.3 * throughput + 0.2 * latency;
        if self.mdns_discovered {
            score += MDNS_BOOST;
        }
        score.clamp(0.0, 1.0)
    }
}

/// `avg' = avg·(n−1)/n + x/n` with `n` counting the new sample.
fn running_avg(avg: f64, n: u64, sample: f64) -> f64 {
    let n = n as f64;
    avg * (n - 1.0) / n + sample / n
}

#[derive(Default)]
pub struct PeerScorer {
    config: ScorerConfig,
    peers: RwLock<HashMap<PeerId, PeerScore>>,
}

impl PeerScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_success(
        &self,
        peer: &PeerId,
        bytes: u64,
        latency_ms: f64,
        throughput_bps: f64,
    ) {
        let mut peers = self.peers.write();
        let score = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerScore::new(peer.clone()));
        score.success_count += 1;
        score.bytes_downloaded += bytes;
        score.last_seen = Instant::now();
        if latency_ms >= 0.0 {
            score.latency_samples += 1;
            score.avg_latency_ms = running_avg(score.avg_latency_ms, score.latency_samples, latency_ms);
        }
        // Samples derived from a non-positive duration would poison the
        // average with infinities.
        if throughput_bps > 0.0 && throughput_bps.is_finite() {
            score.throughput_samples += 1;
            score.avg_throughput_bps =
                running_avg(score.avg_throughput_bps, score.throughput_samples, throughput_bps);
        }
    }

    pub fn record_failure(&self, peer: &PeerId, reason: &str) {
        let mut peers = self.peers.write();
        let score = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerScore::new(peer.clone()));
        score.failure_count += 1;
        score.last_seen = Instant::now();
        tracing::debug!(target: LOG_TARGET, peer = %peer, reason, "peer failure recorded");
    }

    pub fn record_upload(&self, peer: &PeerId, bytes: u64) {
        let mut peers = self.peers.write();
        let score = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerScore::new(peer.clone()));
        score.bytes_uploaded += bytes;
        score.last_seen = Instant::now();
    }

    pub fn mark_mdns(&self, peer: &PeerId) {
        let mut peers = self.peers.write();
        let score = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerScore::new(peer.clone()));
        score.mdns_discovered = true;
    }

    pub fn blacklist(&self, peer: &PeerId, reason: &str, duration: Duration) {
        let mut peers = self.peers.write();
        let score = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerScore::new(peer.clone()));
        score.blacklisted_until = Some(Instant::now() + duration);
        score.blacklist_reason = Some(reason.to_owned());
        tracing::warn!(
            target: LOG_TARGET,
            peer = %peer,
            reason,
            duration_secs = duration.as_secs(),
            "peer blacklisted",
        );
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        let peers = self.peers.read();
        peers.get(peer).is_some_and(|s| s.blacklist_active())
    }

    /// Current score in `[0, 1]`; unknown peers score the neutral prior.
    pub fn get_score(&self, peer: &PeerId) -> f64 {
        let peers = self.peers.read();
        peers
            .get(peer)
            .map(|s| s.score())
            .unwrap_or_else(|| PeerScore::new(peer.clone()).score())
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerScore> {
        self.peers.read().get(peer).cloned()
    }

    /// All known scores, for stats surfaces and the adaptive rate
    /// limiter.
    pub fn snapshot(&self) -> Vec<PeerScore> {
        self.peers.read().values().cloned().collect()
    }

    /// Rank `candidates` by score, skipping blacklisted peers, and cap
    /// how many selected peers may share one network block so a single
    /// operator cannot dominate a download.
    pub fn select_diverse(&self, candidates: &[PeerInfo], k: usize) -> Vec<PeerInfo> {
        if k == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<(f64, &PeerInfo)> = {
            let peers = self.peers.read();
            candidates
                .iter()
                .filter(|info| {
                    !peers
                        .get(&info.peer_id)
                        .is_some_and(|s| s.blacklist_active())
                })
                .map(|info| {
                    let score = peers
                        .get(&info.peer_id)
                        .map(|s| s.score())
                        .unwrap_or_else(|| PeerScore::new(info.peer_id.clone()).score());
                    (score, info)
                })
                .collect()
        };
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let max_per_block =
            ((k as f64 * self.config.max_same_block_fraction).floor() as usize).max(1);
        let mut per_block: HashMap<String, usize> = HashMap::new();
        let mut selected = Vec::with_capacity(k);
        for (_, info) in ranked {
            if selected.len() >= k {
                break;
            }
            match network_block(info) {
                Some(block) => {
                    let count = per_block.entry(block).or_insert(0);
                    if *count >= max_per_block {
                        continue;
                    }
                    *count += 1;
                }
                None => {}
            }
            selected.push(info.clone());
        }
        selected
    }

    /// Drop peers unseen for longer than the idle window. Returns how
    /// many were removed.
    pub fn cleanup(&self) -> usize {
        let idle_window = self.config.idle_window;
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, score| score.last_seen.elapsed() < idle_window);
        before - peers.len()
    }
}

/// /24 (IPv4) or /48 (IPv6) block of the peer's first IP address.
fn network_block(info: &PeerInfo) -> Option<String> {
    let ip = info.addrs.iter().find_map(|addr| addr.ip())?;
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(format!("{}.{}.{}/24", octets[0], octets[1], octets[2]))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            Some(format!(
                "{:x}:{:x}:{:x}/48",
                segments[0], segments[1], segments[2]
            ))
        }
    }
}
