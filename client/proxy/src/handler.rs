//! The proxy request flow.
//!
//! Package requests resolve their expected hash and size through the
//! index, stream straight from the cache on a hit, and otherwise run a
//! coalesced multi-source download: DHT providers are filtered (self,
//! blocklist, private addresses), ranked by the scorer, and raced
//! against the upstream mirror. Verified bytes are cached and announced
//! asynchronously. Index, release and unknown requests pass through to
//! the mirror, with top-level `Packages` bodies ingested on the side.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;

use dsc_common::address_filter::{filter_blocked_addrs, is_allowed_mirror_url, is_loopback_mirror_url};
use dsc_common::{ContentFingerprint, PackageMeta, PeerId, PeerInfo, SourceKind};
use dsc_downloader::{
    ChunkSource, Coalescer, FetchError, MirrorFetcher, MirrorSource, MirrorStats,
    ParallelDownloader, PeerSource,
};
use dsc_package_cache::{BlobReader, CacheError, PackageCache};
use dsc_package_index::PackageIndex;
use dsc_peer_manager::{Operation, PeerScorer, TimeoutManager};
use dsc_peer_transfer_service::PeerTransferClient;
use dsc_swarm::{AnnouncePool, ProviderDht};

use crate::classify::{
    classify, extract_target_url, lookup_path, should_ingest_index, RequestClass,
};
use crate::error::{with_security_headers, ProxyError};
use crate::metrics::ProxyMetrics;

const LOG_TARGET: &str = "proxy";

pub const PACKAGE_CONTENT_TYPE: &str = "application/vnd.debian.binary-package";
pub const X_SOURCE: &str = "X-Source";

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Additional mirror hostnames accepted by the target filter.
    pub extra_allowed_hosts: Vec<String>,
    /// Providers requested per DHT lookup.
    pub dht_lookup_limit: usize,
    /// Peer sources handed to the downloader per package.
    pub max_peer_sources: usize,
    /// Non-empty ⇒ private-swarm mode: only these peers are used and
    /// announcements are suppressed.
    pub peer_allowlist: Vec<PeerId>,
    pub peer_blocklist: Vec<PeerId>,
    /// Accept mirrors on loopback addresses (chained local mirrors).
    pub allow_loopback_mirrors: bool,
    /// Keep private provider addresses (locally-discovered swarms).
    pub allow_private_peer_addrs: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            extra_allowed_hosts: Vec::new(),
            dht_lookup_limit: 20,
            max_peer_sources: 5,
            peer_allowlist: Vec::new(),
            peer_blocklist: Vec::new(),
            allow_loopback_mirrors: false,
            allow_private_peer_addrs: false,
        }
    }
}

impl ProxyConfig {
    pub fn private_swarm(&self) -> bool {
        !self.peer_allowlist.is_empty()
    }
}

/// Everything the proxy flow drives.
pub struct ProxyDeps {
    pub cache: Arc<dyn PackageCache>,
    pub index: Arc<dyn PackageIndex>,
    pub dht: Arc<dyn ProviderDht>,
    pub scorer: Arc<PeerScorer>,
    pub timeouts: Arc<TimeoutManager>,
    pub fetcher: Arc<MirrorFetcher>,
    pub downloader: Arc<ParallelDownloader>,
    pub transfer_client: Arc<PeerTransferClient>,
    pub announce: Arc<AnnouncePool>,
}

#[derive(Clone)]
struct FetchedPackage {
    data: Bytes,
    source: SourceKind,
}

pub struct ProxyService {
    config: ProxyConfig,
    cache: Arc<dyn PackageCache>,
    index: Arc<dyn PackageIndex>,
    dht: Arc<dyn ProviderDht>,
    scorer: Arc<PeerScorer>,
    timeouts: Arc<TimeoutManager>,
    fetcher: Arc<MirrorFetcher>,
    downloader: Arc<ParallelDownloader>,
    transfer_client: Arc<PeerTransferClient>,
    announce: Arc<AnnouncePool>,
    coalescer: Coalescer<Result<FetchedPackage, ProxyError>>,
    metrics: ProxyMetrics,
}

impl ProxyService {
    pub fn new(config: ProxyConfig, deps: ProxyDeps) -> Result<Arc<Self>, prometheus::Error> {
        Ok(Arc::new(Self {
            config,
            cache: deps.cache,
            index: deps.index,
            dht: deps.dht,
            scorer: deps.scorer,
            timeouts: deps.timeouts,
            fetcher: deps.fetcher,
            downloader: deps.downloader,
            transfer_client: deps.transfer_client,
            announce: deps.announce,
            coalescer: Coalescer::new(),
            metrics: ProxyMetrics::new()?,
        }))
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Entry point for every proxied request.
    pub async fn handle_request(self: &Arc<Self>, req: axum::extract::Request) -> Response {
        self.metrics.requests_total.inc();
        self.metrics.active_connections.inc();
        let response = self.dispatch(req).await;
        self.metrics.active_connections.dec();
        if response.status().is_client_error() || response.status().is_server_error() {
            self.metrics.requests_failed.inc();
        }
        response
    }

    async fn dispatch(self: &Arc<Self>, req: axum::extract::Request) -> Response {
        let method = req.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return with_security_headers(
                (StatusCode::METHOD_NOT_ALLOWED, "only GET and HEAD are proxied").into_response(),
            );
        }
        let head_only = method == Method::HEAD;

        let target = match extract_target_url(req.uri()) {
            Ok(target) => target,
            Err(reason) => {
                self.metrics.requests_blocked.inc();
                return ProxyError::BadTarget(reason).into_response();
            }
        };
        if !self.target_allowed(&target) {
            self.metrics.requests_blocked.inc();
            tracing::warn!(target: LOG_TARGET, url = %target, "blocked proxy target");
            return ProxyError::BlockedTarget.into_response();
        }

        let class = classify(&target);
        tracing::debug!(target: LOG_TARGET, url = %target, class = ?class, "proxying request");
        let outcome = match class {
            RequestClass::Package => self.handle_package(&target, head_only).await,
            RequestClass::Index => self.handle_index(&target, head_only).await,
            RequestClass::Release | RequestClass::Unknown => {
                self.passthrough(&target, head_only).await
            }
        };
        match outcome {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    fn target_allowed(&self, target: &str) -> bool {
        is_allowed_mirror_url(target, &self.config.extra_allowed_hosts)
            || (self.config.allow_loopback_mirrors && is_loopback_mirror_url(target))
    }

    async fn handle_package(
        self: &Arc<Self>,
        target: &str,
        head_only: bool,
    ) -> Result<Response, ProxyError> {
        let Some(meta) = self.index.lookup_by_url_path(lookup_path(target)) else {
            // No expected hash means no verification and no caching;
            // hand the request to the mirror as-is.
            tracing::debug!(target: LOG_TARGET, url = %target, "package not in index, mirror passthrough");
            return self.passthrough(target, head_only).await;
        };

        match self.cache.get(&meta.sha256).await {
            Ok((reader, blob)) => {
                tracing::debug!(target: LOG_TARGET, hash = %meta.sha256, "cache hit");
                self.metrics.count_source(SourceKind::Cache);
                return Ok(blob_response(reader, blob.size, SourceKind::Cache, head_only));
            }
            Err(CacheError::NotFound) => {}
            Err(err) => return Err(ProxyError::Cache(err.to_string())),
        }

        // One download per fingerprint, no matter how many clients ask.
        let key = meta.sha256.to_hex();
        let service = Arc::clone(self);
        let download_meta = meta.clone();
        let download_target = target.to_owned();
        let (result, leader) = self
            .coalescer
            .run(&key, move || async move {
                service.download_package(download_meta, download_target).await
            })
            .await;
        let fetched = result?;
        if leader {
            tracing::info!(
                target: LOG_TARGET,
                hash = %meta.sha256,
                source = %fetched.source,
                bytes = fetched.data.len(),
                "package downloaded",
            );
        }
        self.metrics.count_source(fetched.source);
        Ok(bytes_response(
            fetched.data,
            PACKAGE_CONTENT_TYPE,
            fetched.source,
            head_only,
        ))
    }

    /// The coalesced leader path: discover providers, race them against
    /// the mirror, verify, cache, announce.
    async fn download_package(
        self: Arc<Self>,
        meta: PackageMeta,
        target: String,
    ) -> Result<FetchedPackage, ProxyError> {
        let providers = self.discover_providers(&meta.sha256).await;
        let ranked = self
            .scorer
            .select_diverse(&providers, self.config.max_peer_sources);
        tracing::debug!(
            target: LOG_TARGET,
            hash = %meta.sha256,
            providers = providers.len(),
            selected = ranked.len(),
            "building download sources",
        );

        let peer_sources: Vec<Arc<dyn ChunkSource>> = ranked
            .into_iter()
            .map(|info| {
                Arc::new(PeerSource::new(
                    info,
                    meta.sha256,
                    Arc::clone(&self.transfer_client),
                )) as Arc<dyn ChunkSource>
            })
            .collect();
        let mirror: Arc<dyn ChunkSource> = Arc::new(MirrorSource::new(
            target.clone(),
            Arc::clone(&self.fetcher),
        ));

        let result = self
            .downloader
            .download(&meta.sha256, meta.size, peer_sources, Some(mirror))
            .await
            .map_err(|err| ProxyError::Download(err.to_string()))?;

        self.metrics.bytes_from_peer.inc_by(result.peer_bytes);
        self.metrics.bytes_from_mirror.inc_by(result.mirror_bytes);

        let mut data_reader: &[u8] = &result.data;
        match self
            .cache
            .put(&mut data_reader, &meta.sha256, &meta.filename)
            .await
        {
            Ok(_) => {
                self.announce.announce(meta.sha256);
            }
            Err(err) => {
                // The bytes are verified; failing to cache them costs a
                // future download, not this response.
                tracing::error!(
                    target: LOG_TARGET,
                    hash = %meta.sha256,
                    error = %err,
                    "failed to cache downloaded package",
                );
            }
        }

        Ok(FetchedPackage {
            data: result.data,
            source: result.source,
        })
    }

    async fn discover_providers(&self, hash: &ContentFingerprint) -> Vec<PeerInfo> {
        let key = hash.dht_key();
        let lookup_timeout = self.timeouts.get(Operation::DhtLookup);
        let started = Instant::now();
        let found = match timeout(
            lookup_timeout,
            self.dht.find_providers(&key, self.config.dht_lookup_limit),
        )
        .await
        {
            Ok(Ok(providers)) => {
                self.timeouts
                    .record_success(Operation::DhtLookup, started.elapsed());
                providers
            }
            Ok(Err(err)) => {
                tracing::warn!(target: LOG_TARGET, key, error = %err, "provider lookup failed");
                self.timeouts.record_failure(Operation::DhtLookup);
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(target: LOG_TARGET, key, "provider lookup timed out");
                self.timeouts.record_failure(Operation::DhtLookup);
                Vec::new()
            }
        };

        let local = self.dht.local_peer_id();
        found
            .into_iter()
            .filter(|info| info.peer_id != local)
            .filter(|info| !self.config.peer_blocklist.contains(&info.peer_id))
            .filter(|info| {
                !self.config.private_swarm() || self.config.peer_allowlist.contains(&info.peer_id)
            })
            .filter(|info| !self.scorer.is_blacklisted(&info.peer_id))
            .filter_map(|info| {
                let PeerInfo { peer_id, addrs } = info;
                let addrs = if self.config.allow_private_peer_addrs {
                    addrs
                } else {
                    filter_blocked_addrs(addrs)
                };
                if addrs.is_empty() {
                    None
                } else {
                    Some(PeerInfo::new(peer_id, addrs))
                }
            })
            .collect()
    }

    async fn handle_index(
        self: &Arc<Self>,
        target: &str,
        head_only: bool,
    ) -> Result<Response, ProxyError> {
        if head_only {
            return self.passthrough(target, true).await;
        }
        let body = self.fetch_upstream(target).await?;
        self.metrics.count_source(SourceKind::Mirror);
        self.metrics.bytes_from_mirror.inc_by(body.len() as u64);

        if should_ingest_index(target) {
            if let Ok(text) = std::str::from_utf8(&body) {
                let index = Arc::clone(&self.index);
                let repo = target.to_owned();
                let text = text.to_owned();
                tokio::spawn(async move {
                    let added = index.ingest(&repo, &text);
                    tracing::debug!(target: LOG_TARGET, repo, added, "index ingested");
                });
            }
        }

        Ok(bytes_response(
            body,
            content_type_of(target),
            SourceKind::Mirror,
            false,
        ))
    }

    async fn passthrough(
        self: &Arc<Self>,
        target: &str,
        head_only: bool,
    ) -> Result<Response, ProxyError> {
        if head_only {
            let headers = self
                .fetcher
                .head(target)
                .await
                .map_err(upstream_error)?;
            self.metrics.count_source(SourceKind::Mirror);
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type_of(target))
                .header(X_SOURCE, SourceKind::Mirror.as_str());
            if let Some(len) = headers.get(header::CONTENT_LENGTH) {
                builder = builder.header(header::CONTENT_LENGTH, len.clone());
            }
            return Ok(builder
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()));
        }

        let body = self.fetch_upstream(target).await?;
        self.metrics.count_source(SourceKind::Mirror);
        self.metrics.bytes_from_mirror.inc_by(body.len() as u64);
        Ok(bytes_response(
            body,
            content_type_of(target),
            SourceKind::Mirror,
            false,
        ))
    }

    async fn fetch_upstream(&self, target: &str) -> Result<Bytes, ProxyError> {
        self.fetcher.fetch(target).await.map_err(upstream_error)
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.metrics.requests_total.get(),
            requests_cache: self.metrics.requests_cache.get(),
            requests_peer: self.metrics.requests_peer.get(),
            requests_mirror: self.metrics.requests_mirror.get(),
            requests_mixed: self.metrics.requests_mixed.get(),
            requests_blocked: self.metrics.requests_blocked.get(),
            requests_failed: self.metrics.requests_failed.get(),
            bytes_from_peer: self.metrics.bytes_from_peer.get(),
            bytes_from_mirror: self.metrics.bytes_from_mirror.get(),
            active_connections: self.metrics.active_connections.get(),
            cache_blobs: self.cache.count().await,
            cache_bytes: self.cache.size().await,
            peers_known: self.scorer.snapshot().len(),
            announces_sent: self.announce.announced(),
            announces_dropped: self.announce.dropped(),
            mirrors: self.fetcher.stats(),
        }
    }
}

#[derive(Serialize)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub requests_cache: u64,
    pub requests_peer: u64,
    pub requests_mirror: u64,
    pub requests_mixed: u64,
    pub requests_blocked: u64,
    pub requests_failed: u64,
    pub bytes_from_peer: u64,
    pub bytes_from_mirror: u64,
    pub active_connections: i64,
    pub cache_blobs: usize,
    pub cache_bytes: u64,
    pub peers_known: usize,
    pub announces_sent: u64,
    pub announces_dropped: u64,
    pub mirrors: Vec<MirrorStats>,
}

fn upstream_error(err: FetchError) -> ProxyError {
    fn status_of(err: &FetchError) -> Option<u16> {
        match err {
            FetchError::Status { status } => Some(*status),
            FetchError::Exhausted { source, .. } => status_of(source),
            _ => None,
        }
    }
    match status_of(&err) {
        Some(status) => ProxyError::UpstreamStatus(status),
        None => ProxyError::Upstream(err.to_string()),
    }
}

fn content_type_of(target: &str) -> &'static str {
    let lower = target.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    if path.ends_with(".deb") {
        PACKAGE_CONTENT_TYPE
    } else if path.ends_with(".gz") {
        "application/gzip"
    } else if path.ends_with(".xz") {
        "application/x-xz"
    } else if path.ends_with(".bz2") {
        "application/x-bzip2"
    } else if path.ends_with("/release")
        || path.ends_with("/inrelease")
        || path.ends_with("/packages")
        || path.ends_with("/sources")
    {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn blob_response(reader: BlobReader, size: u64, source: SourceKind, head_only: bool) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PACKAGE_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, size)
        .header(X_SOURCE, source.as_str());
    let body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(reader))
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn bytes_response(
    data: Bytes,
    content_type: &'static str,
    source: SourceKind,
    head_only: bool,
) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(X_SOURCE, source.as_str());
    let body = if head_only { Body::empty() } else { Body::from(data) };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
