//! Service wiring and lifecycle.
//!
//! Builds the cache, index, DHT, scorer, rate limiters, transfer
//! service, downloader and proxy from the configuration, runs them until
//! ctrl-c, then shuts down in order: stop accepting proxy requests,
//! drain the announce workers, stop the peer listener, drop the cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use dsc_common::retry::{Backoff, RetryPolicy};
use dsc_common::PeerId;
use dsc_downloader::{
    DirStateStore, DownloaderConfig, MirrorConfig, MirrorFetcher, ParallelDownloader,
};
use dsc_package_cache::{FsPackageCache, PackageCache};
use dsc_package_index::{MemoryPackageIndex, PackageIndex};
use dsc_peer_manager::{Operation, PeerRateLimiters, PeerScorer, ScorerConfig, TimeoutManager};
use dsc_peer_transfer_service::{
    PeerTransferClient, PeerTransferService, TransferServiceConfig,
};
use dsc_proxy::{router, ProxyConfig, ProxyDeps, ProxyService};
use dsc_swarm::announce::spawn_reannounce_loop;
use dsc_swarm::{
    load_or_create_identity, load_or_create_psk, AnnounceConfig, AnnouncePool, MemoryDht,
    ProviderDht,
};

use crate::config::Config;

const LOG_TARGET: &str = "dswarm-node";

const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const REANNOUNCE_AFTER: Duration = Duration::from_secs(60 * 60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const ANNOUNCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let identity = load_or_create_identity(&config.state_dir.join("identity.key"))
        .context("loading node identity")?;
    let _psk = load_or_create_psk(&config.state_dir.join("swarm.key"))
        .context("loading swarm pre-shared key")?;
    tracing::info!(target: LOG_TARGET, peer_id = %identity.peer_id(), "node identity loaded");

    let cache: Arc<dyn PackageCache> = Arc::new(
        FsPackageCache::open(config.state_dir.join("cache")).context("opening package cache")?,
    );
    let index: Arc<dyn PackageIndex> = Arc::new(MemoryPackageIndex::new());
    let dht: Arc<dyn ProviderDht> = Arc::new(MemoryDht::new(
        identity.peer_id().clone(),
        Vec::new(),
    ));

    let scorer = Arc::new(PeerScorer::new(ScorerConfig::default()));
    let timeouts = Arc::new(TimeoutManager::new());
    timeouts.set_base(
        Operation::PeerConnect,
        Duration::from_secs(config.p2p_timeout_secs.max(1)),
    );
    let limiters = Arc::new(PeerRateLimiters::new(
        config.rate_limits.to_rate_limit_config(),
    ));

    let fetcher = Arc::new(
        MirrorFetcher::new(MirrorConfig {
            max_response_size: config.max_response_size,
            request_timeout: Duration::from_secs(config.mirror_timeout_secs.max(1)),
            retry: RetryPolicy::new(3, Backoff::Exponential(Duration::from_millis(500))),
        })
        .map_err(|err| anyhow::anyhow!("building mirror fetcher: {err}"))?,
    );
    let transfer_client = Arc::new(PeerTransferClient::new(
        Arc::clone(&scorer),
        Arc::clone(&timeouts),
        Arc::clone(&limiters),
        config.max_transfer_size,
    ));

    let mut downloader = ParallelDownloader::new(
        DownloaderConfig {
            chunk_size: config.chunk_size,
            max_concurrent: config.max_concurrent_chunks,
            ..Default::default()
        },
        Arc::clone(&scorer),
    );
    if config.resume_downloads {
        downloader = downloader
            .with_state_store(Arc::new(DirStateStore::new(config.state_dir.join("partial"))));
    }
    let downloader = Arc::new(downloader);

    let announce = AnnouncePool::new(
        Arc::clone(&dht),
        AnnounceConfig {
            suppress: config.private_swarm(),
            ..Default::default()
        },
    );
    if config.private_swarm() {
        tracing::info!(target: LOG_TARGET, "private-swarm mode: DHT announcements suppressed");
    }

    let background = CancellationToken::new();

    // Serve cached blobs to other proxies.
    let transfer_service = PeerTransferService::new(
        Arc::clone(&cache),
        Arc::clone(&scorer),
        Arc::clone(&limiters),
        TransferServiceConfig {
            max_concurrent_uploads: config.max_concurrent_uploads,
            max_uploads_per_peer: config.max_uploads_per_peer,
            max_transfer_size: config.max_transfer_size,
            ..Default::default()
        },
    );
    let peer_listener = TcpListener::bind(config.peer_listen_addr)
        .await
        .with_context(|| format!("binding peer listener on {}", config.peer_listen_addr))?;
    let transfer_task = tokio::spawn(
        Arc::clone(&transfer_service).serve(peer_listener, background.clone()),
    );

    let reannounce_task = spawn_reannounce_loop(
        Arc::clone(&cache),
        Arc::clone(&announce),
        REANNOUNCE_INTERVAL,
        REANNOUNCE_AFTER,
        background.clone(),
    );
    let maintenance_task = spawn_maintenance_loop(
        Arc::clone(&scorer),
        Arc::clone(&limiters),
        Arc::clone(&timeouts),
        background.clone(),
    );

    if let Err(err) = dht.bootstrap().await {
        tracing::warn!(target: LOG_TARGET, error = %err, "dht bootstrap failed");
    }

    let service = ProxyService::new(
        ProxyConfig {
            extra_allowed_hosts: config.extra_allowed_hosts.clone(),
            dht_lookup_limit: config.dht_lookup_limit,
            max_peer_sources: config.max_peer_sources,
            peer_allowlist: config
                .peer_allowlist
                .iter()
                .map(|id| PeerId::from(id.as_str()))
                .collect(),
            peer_blocklist: config
                .peer_blocklist
                .iter()
                .map(|id| PeerId::from(id.as_str()))
                .collect(),
            allow_loopback_mirrors: config.allow_loopback_mirrors,
            allow_private_peer_addrs: config.allow_private_peer_addrs,
        },
        ProxyDeps {
            cache: Arc::clone(&cache),
            index,
            dht,
            scorer,
            timeouts,
            fetcher,
            downloader,
            transfer_client,
            announce: Arc::clone(&announce),
        },
    )
    .map_err(|err| anyhow::anyhow!("registering metrics: {err}"))?;

    // Optional separate admin endpoint.
    if let Some(metrics_addr) = config.metrics_addr {
        let admin = router(Arc::clone(&service));
        let listener = TcpListener::bind(metrics_addr)
            .await
            .with_context(|| format!("binding metrics listener on {metrics_addr}"))?;
        tracing::info!(target: LOG_TARGET, addr = %metrics_addr, "metrics endpoint listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, admin).await {
                tracing::error!(target: LOG_TARGET, error = %err, "metrics server failed");
            }
        });
    }

    let app = router(Arc::clone(&service));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding proxy listener on {}", config.listen_addr))?;
    tracing::info!(target: LOG_TARGET, addr = %config.listen_addr, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("proxy server failed")?;

    // New requests have stopped; wind the swarm side down.
    tracing::info!(target: LOG_TARGET, "shutting down");
    announce.shutdown(ANNOUNCE_DRAIN_TIMEOUT).await;
    background.cancel();
    let _ = transfer_task.await;
    let _ = reannounce_task.await;
    let _ = maintenance_task.await;
    tracing::info!(target: LOG_TARGET, "shutdown complete");
    Ok(())
}

/// Periodic upkeep: stale peers out of the scorer, idle rate-limit
/// buckets dropped, adaptive rates refreshed, timeouts decayed.
fn spawn_maintenance_loop(
    scorer: Arc<PeerScorer>,
    limiters: Arc<PeerRateLimiters>,
    timeouts: Arc<TimeoutManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_recalc = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let removed = scorer.cleanup();
            if removed > 0 {
                tracing::debug!(target: LOG_TARGET, removed, "dropped idle peers");
            }
            limiters.prune_idle();
            if limiters.config().adaptive_enabled
                && last_recalc.elapsed() >= limiters.config().adaptive_recalc_interval
            {
                limiters.recalculate(&scorer.snapshot());
                last_recalc = tokio::time::Instant::now();
            }
            timeouts.reset_decay(0.05);
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(target: LOG_TARGET, error = %err, "failed to listen for ctrl-c");
        // Without a signal handler the only clean exit is an external kill.
        std::future::pending::<()>().await;
    }
}
