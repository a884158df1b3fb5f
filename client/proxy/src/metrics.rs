//! Prometheus counters for the proxy surface.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use dsc_common::SourceKind;

pub struct ProxyMetrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub requests_cache: IntCounter,
    pub requests_peer: IntCounter,
    pub requests_mirror: IntCounter,
    pub requests_mixed: IntCounter,
    pub requests_blocked: IntCounter,
    pub requests_failed: IntCounter,
    pub bytes_from_peer: IntCounter,
    pub bytes_from_mirror: IntCounter,
    pub active_connections: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let requests_total = counter(&registry, "dswarm_requests_total", "Requests received")?;
        let requests_cache = counter(
            &registry,
            "dswarm_requests_cache_total",
            "Requests served from the local cache",
        )?;
        let requests_peer = counter(
            &registry,
            "dswarm_requests_peer_total",
            "Requests served from peers",
        )?;
        let requests_mirror = counter(
            &registry,
            "dswarm_requests_mirror_total",
            "Requests served from upstream mirrors",
        )?;
        let requests_mixed = counter(
            &registry,
            "dswarm_requests_mixed_total",
            "Requests served from peers and mirror together",
        )?;
        let requests_blocked = counter(
            &registry,
            "dswarm_requests_blocked_total",
            "Requests rejected by the target filter",
        )?;
        let requests_failed = counter(
            &registry,
            "dswarm_requests_failed_total",
            "Requests that ended in an error response",
        )?;
        let bytes_from_peer = counter(
            &registry,
            "dswarm_bytes_from_peer_total",
            "Payload bytes downloaded from peers",
        )?;
        let bytes_from_mirror = counter(
            &registry,
            "dswarm_bytes_from_mirror_total",
            "Payload bytes downloaded from mirrors",
        )?;
        let active_connections = IntGauge::with_opts(Opts::new(
            "dswarm_active_connections",
            "Requests currently being served",
        ))?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_cache,
            requests_peer,
            requests_mirror,
            requests_mixed,
            requests_blocked,
            requests_failed,
            bytes_from_peer,
            bytes_from_mirror,
            active_connections,
        })
    }

    pub fn count_source(&self, source: SourceKind) {
        match source {
            SourceKind::Cache => self.requests_cache.inc(),
            SourceKind::Peer => self.requests_peer.inc(),
            SourceKind::Mirror => self.requests_mirror.inc(),
            SourceKind::Mixed => self.requests_mixed.inc(),
        }
    }

    /// Render the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(target: "proxy", error = %err, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
